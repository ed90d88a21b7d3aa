// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Per-UNI technology-profile bookkeeping.
//!
//! The profile parameters themselves come from the orchestration system;
//! this module tracks which profile path is active on which UNI, whether
//! its ANI provisioning has completed, and mirrors the profiles into the
//! key-value store so a restarted adapter can reconcile instead of
//! re-provisioning blindly.

use crate::proxy::KvStore;
use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

/// Parameters of one GEM port within a technology profile.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GemPortParams {
    pub gem_id: u16,
    /// OMCI direction code; 3 means bidirectional.
    pub direction: u8,
    /// Index of the priority queue this GEM port maps to, within its
    /// T-CONT (upstream) or UNI (downstream).
    pub prio_queue_index: u8,
    /// Scheduling weight; [`crate::WEIGHT_STRICT_PRIORITY`] selects
    /// strict-priority scheduling.
    pub weight: u16,
    /// The priority bits this GEM port claims: bit i covers priority i.
    pub pbit_map: u8,
}

/// The T-CONT and GEM-port parameters provisioned for one UNI.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PonAniConfig {
    pub alloc_id: u16,
    pub gem_ports: Vec<GemPortParams>,
}

/// The record persisted per UNI: the profile path plus the parameters
/// needed to resume provisioning after a restart.
#[derive(Debug, Deserialize, Serialize)]
struct StoredProfile {
    path: String,
    config: Option<PonAniConfig>,
}

/// Extract the technology-profile id from a profile path such as
/// `XGS-PON/64/olt-1/pon-0/onu-1/uni-0`.
pub fn tp_id_from_path(path: &str) -> Option<u16> {
    path.split('/').nth(1)?.parse().ok()
}

#[derive(Debug, Default)]
struct UniTpState {
    path: String,
    config: Option<PonAniConfig>,
    done: bool,
}

/// Technology-profile state for one device.
pub struct TechProfileManager {
    device_id: String,
    log: Logger,
    kv: Arc<dyn KvStore>,
    unis: Mutex<BTreeMap<u8, UniTpState>>,
}

impl TechProfileManager {
    pub fn new(device_id: &str, kv: Arc<dyn KvStore>, log: &Logger) -> Self {
        Self {
            device_id: device_id.to_string(),
            log: log.new(o!("component" => "tech-profile", "device_id" => device_id.to_string())),
            kv,
            unis: Mutex::new(BTreeMap::new()),
        }
    }

    fn kv_key(&self, uni_id: u8) -> String {
        format!("{}/tp/{}", self.device_id, uni_id)
    }

    fn kv_prefix(&self) -> String {
        format!("{}/tp/", self.device_id)
    }

    /// Record `path` as the active profile of `uni_id`. Returns true if
    /// the path is new or changed, i.e. provisioning work is required.
    pub fn update_path(&self, uni_id: u8, path: &str) -> bool {
        let mut unis = self.unis.lock().unwrap();
        let state = unis.entry(uni_id).or_default();
        if state.path == path {
            debug!(self.log, "profile path unchanged"; "uni_id" => uni_id, "path" => path);
            return false;
        }
        state.path = path.to_string();
        state.done = false;
        true
    }

    pub fn set_config(&self, uni_id: u8, config: PonAniConfig) {
        let mut unis = self.unis.lock().unwrap();
        unis.entry(uni_id).or_default().config = Some(config);
    }

    pub fn config(&self, uni_id: u8) -> Option<PonAniConfig> {
        self.unis
            .lock()
            .unwrap()
            .get(&uni_id)
            .and_then(|s| s.config.clone())
    }

    pub fn path(&self, uni_id: u8) -> Option<String> {
        self.unis
            .lock()
            .unwrap()
            .get(&uni_id)
            .filter(|s| !s.path.is_empty())
            .map(|s| s.path.clone())
    }

    pub fn mark_done(&self, uni_id: u8, done: bool) {
        let mut unis = self.unis.lock().unwrap();
        unis.entry(uni_id).or_default().done = done;
    }

    pub fn is_done(&self, uni_id: u8) -> bool {
        self.unis
            .lock()
            .unwrap()
            .get(&uni_id)
            .is_some_and(|s| s.done)
    }

    /// Write the active profile of `uni_id` to the key-value store.
    pub fn persist(&self, uni_id: u8) -> Result<(), Error> {
        let record = {
            let unis = self.unis.lock().unwrap();
            let Some(state) = unis.get(&uni_id).filter(|s| !s.path.is_empty()) else {
                return Ok(());
            };
            StoredProfile {
                path: state.path.clone(),
                config: state.config.clone(),
            }
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| Error::Collaborator(format!("profile record for UNI {uni_id}: {e}")))?;
        self.kv.put(&self.kv_key(uni_id), &value)
    }

    /// Forget the profile of `uni_id`, in memory and in the store.
    pub fn clear(&self, uni_id: u8) -> Result<(), Error> {
        self.unis.lock().unwrap().remove(&uni_id);
        self.kv.delete(&self.kv_key(uni_id))
    }

    /// Drop one GEM port from the stored parameters. Returns true if the
    /// port was known.
    pub fn remove_gem_port(&self, uni_id: u8, gem_id: u16) -> bool {
        let mut unis = self.unis.lock().unwrap();
        let Some(config) = unis.get_mut(&uni_id).and_then(|s| s.config.as_mut()) else {
            return false;
        };
        let before = config.gem_ports.len();
        config.gem_ports.retain(|g| g.gem_id != gem_id);
        config.gem_ports.len() != before
    }

    /// Load the persisted UNI→profile mapping, e.g. at reconciliation
    /// start. Returns the restored paths.
    pub fn restore(&self) -> Result<Vec<(u8, String)>, Error> {
        let prefix = self.kv_prefix();
        let mut restored = Vec::new();
        for (key, value) in self.kv.list(&prefix)? {
            let Some(uni_id) = key
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse().ok())
            else {
                continue;
            };
            let record: StoredProfile = serde_json::from_str(&value)
                .map_err(|e| Error::Collaborator(format!("stored profile {key}: {e}")))?;
            let mut unis = self.unis.lock().unwrap();
            let state = unis.entry(uni_id).or_default();
            state.path = record.path.clone();
            state.config = record.config;
            state.done = false;
            restored.push((uni_id, record.path));
        }
        Ok(restored)
    }

    /// All UNIs with an active path.
    pub fn paths(&self) -> Vec<(u8, String)> {
        self.unis
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| !s.path.is_empty())
            .map(|(uni, s)| (*uni, s.path.clone()))
            .collect()
    }

    /// Remove every persisted path of this device, on device delete.
    pub fn purge(&self) -> Result<(), Error> {
        self.unis.lock().unwrap().clear();
        self.kv.delete_prefix(&self.kv_prefix())
    }
}
