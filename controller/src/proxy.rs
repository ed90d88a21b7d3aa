// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Interfaces to the surrounding orchestration system.
//!
//! Everything the control plane tells the outside world goes through the
//! traits here. Calls are fire-and-forget from the state machines'
//! perspective: failures are logged by the caller, never retried, except
//! where a call is explicitly fatal to device creation.

use crate::Error;
use serde::Deserialize;
use serde::Serialize;

/// Connectivity of a device as seen by the orchestration system.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectState {
    Unknown,
    Reachable,
    Unreachable,
}

/// Operational state of a device or port.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    Unknown,
    Discovered,
    Activating,
    Active,
    Failed,
}

/// The kind of a port registered with the object model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortKind {
    EthernetUni,
    PonOnu,
}

/// A port as registered with the object model.
#[derive(Clone, Debug, PartialEq)]
pub struct PortDescriptor {
    pub port_no: u32,
    pub label: String,
    pub kind: PortKind,
    pub oper: OperState,
}

/// Device/port object-model updates.
pub trait CoreProxy: Send + Sync {
    fn device_state_update(
        &self,
        device_id: &str,
        connect: ConnectState,
        oper: OperState,
    ) -> Result<(), Error>;

    fn device_reason_update(&self, device_id: &str, reason: &str) -> Result<(), Error>;

    fn port_created(&self, device_id: &str, port: &PortDescriptor) -> Result<(), Error>;

    fn port_state_update(&self, device_id: &str, port_no: u32, oper: OperState)
        -> Result<(), Error>;
}

/// A device-active/inactive notification with its telemetry context.
#[derive(Clone, Debug, PartialEq)]
pub struct OnuActivatedEvent {
    pub device_id: String,
    /// True when raising the event, false when clearing it.
    pub raised: bool,
    pub pon_id: u32,
    pub onu_id: u32,
    pub serial_number: String,
    pub olt_serial_number: String,
}

/// Fire-and-forget event/telemetry publication.
pub trait EventSink: Send + Sync {
    fn onu_activated(&self, event: &OnuActivatedEvent);
}

/// Persistence of per-UNI technology-profile paths.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;
    fn put(&self, key: &str, value: &str) -> Result<(), Error>;
    fn delete(&self, key: &str) -> Result<(), Error>;
    /// All (key, value) pairs under a prefix, for reconciliation scans.
    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error>;
    fn delete_prefix(&self, prefix: &str) -> Result<(), Error>;
}

/// One device's status as reported by the status source.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OnuStatus {
    pub id: String,
    pub mac_address: String,
    pub oper_state: OperState,
    pub connect_state: ConnectState,
}

/// The narrow interface the status supervisor polls.
pub trait OnuStatusSource: Send + Sync {
    fn read_status_list(&self) -> Result<Vec<OnuStatus>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_list_decodes_from_json() {
        // The shape status sources actually serve.
        let json = r#"[{
            "id": "onu-1",
            "mac_address": "aa:bb:cc:dd:ee:ff",
            "oper_state": "active",
            "connect_state": "reachable"
        }]"#;
        let statuses: Vec<OnuStatus> = serde_json::from_str(json).unwrap();
        assert_eq!(
            statuses,
            vec![OnuStatus {
                id: "onu-1".to_string(),
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                oper_state: OperState::Active,
                connect_state: ConnectState::Reachable,
            }]
        );
    }
}
