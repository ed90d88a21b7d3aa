// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Control-plane core of an ONU adapter.
//!
//! This crate drives the OMCI-style management conversation that takes an
//! optical network unit from "newly discovered" to "fully provisioned":
//! the per-device lifecycle machine, the configuration state machines
//! (MIB download, ANI/technology-profile provisioning, admin lock/unlock,
//! per-port VLAN filtering), and the response-correlation discipline that
//! ties each outstanding request to the machine awaiting it.

pub mod ani;
pub mod config;
pub mod device;
pub mod entry;
pub mod flows;
pub mod fsm;
pub mod lock;
pub mod messages;
pub mod mib_download;
pub mod omci;
pub mod proxy;
pub mod status;
pub mod tech_profile;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod uni;
pub mod vlan;

pub use config::Config;
pub use config::ConfigBuilder;
pub use device::DeviceHandler;

use omci_messages::me::MeRef;
use omci_messages::message::MessageKind;
use omci_messages::message::ResultCode;
use slog::Drain;
use thiserror::Error;

/// Build the adapter's root logger: full-format terminal output behind
/// an async drain.
pub fn build_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Entity id of the single GAL Ethernet profile the adapter creates.
pub const GAL_ETHERNET_EID: u16 = 1;

/// Base entity id for MAC bridge service profiles and their UNI-side ports.
pub const MAC_BRIDGE_SERVICE_PROFILE_EID: u16 = 0x201;

/// Base entity id for ANI-side MAC bridge port configuration data.
pub const MAC_BRIDGE_PORT_ANI_EID: u16 = 0x2102;

/// Base entity id for IEEE 802.1p mapper service profiles.
pub const IEEE_MAPPER_SERVICE_PROFILE_EID: u16 = 0x8001;

/// The well-known traffic scheduler WRR queues are pointed at.
pub const TRAFFIC_SCHEDULER_EID: u16 = 0x8000;

/// Weight sentinel meaning "schedule this queue strict-priority".
pub const WEIGHT_STRICT_PRIORITY: u16 = 0xffff;

/// Alloc-id value marking a T-CONT as unassigned.
pub const FREE_ALLOC_ID: u16 = 0xffff;

/// Attribute mask for the ONU2-G reachability probe (first three
/// attributes of the class).
pub const ONU2G_PROBE_ATTR_MASK: u16 = 0xe000;

/// An error in the adapter control plane.
#[derive(Debug, Error)]
pub enum Error {
    /// An inbound envelope could not be decoded.
    #[error("envelope error")]
    Envelope(#[from] omci_messages::Error),

    /// An event was applied that the transition table does not allow.
    #[error("{fsm}: illegal transition on {event} from {state}")]
    IllegalTransition {
        fsm: &'static str,
        state: String,
        event: String,
    },

    /// The remote device reported a non-success result code.
    #[error("request to {me} failed with {result:?}")]
    RequestFailed { me: MeRef, result: ResultCode },

    /// No correlated response arrived within the bound.
    #[error("timed out waiting on {0}")]
    Timeout(&'static str),

    /// A response arrived that fits no outstanding exchange.
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(MessageKind),

    /// The message pump was told to stop.
    #[error("aborted")]
    Aborted,

    /// The outbound transport is gone.
    #[error("management transport closed")]
    TransportClosed,

    /// Provisioning parameters could not be derived from the mirrored
    /// database.
    #[error("cannot derive provisioning parameters: {0}")]
    Derivation(&'static str),

    /// A flow description failed the pre-checks.
    #[error("invalid flow: {0}")]
    InvalidFlow(&'static str),

    /// A flow referenced a port the handler does not know.
    #[error("unknown UNI port {0}")]
    UnknownUniPort(u32),

    /// A VLAN filter machine is already active for the UNI.
    #[error("VLAN filter already active on UNI {0}")]
    VlanFilterActive(u8),

    /// The operation requires a reachable device.
    #[error("device \"{0}\" is not reachable")]
    NotReachable(String),

    /// The operation is not allowed in the device's current phase.
    #[error("operation rejected in phase \"{0}\"")]
    WrongDevicePhase(String),

    /// The shared deadline of a multi-worker operation expired.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// A query against the mirrored managed-entity database failed.
    #[error("mirrored database error")]
    Mib(#[from] onu_mib::Error),

    /// A collaborator (object-model proxy, KV store, status source)
    /// reported a failure.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
