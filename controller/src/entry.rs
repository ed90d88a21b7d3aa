// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The per-device entry: the management channel plus the mirrored
//! managed-entity database, and the synchronization that fills it.

use crate::omci::OmciChannel;
use crate::Error;
use crate::ONU2G_PROBE_ATTR_MASK;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;
use omci_messages::message::MessageBody;
use onu_mib::MibDatabase;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// One known device: its channel and its mirrored database.
pub struct OnuDeviceEntry {
    device_id: String,
    log: Logger,
    channel: Arc<OmciChannel>,
    mib: Arc<RwLock<MibDatabase>>,
}

impl OnuDeviceEntry {
    pub fn new(device_id: &str, channel: Arc<OmciChannel>, log: &Logger) -> Self {
        Self {
            device_id: device_id.to_string(),
            log: log.new(o!("component" => "device-entry", "device_id" => device_id.to_string())),
            channel,
            mib: Arc::new(RwLock::new(MibDatabase::new())),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn channel(&self) -> Arc<OmciChannel> {
        self.channel.clone()
    }

    /// A point-in-time copy of the mirrored database.
    pub async fn mib_snapshot(&self) -> MibDatabase {
        self.mib.read().await.clone()
    }

    /// Probe the device with an ONU2-G read.
    ///
    /// The probe is advisory: synchronization proceeds either way, and
    /// the result only informs logging and the reported connect state.
    pub async fn verify_reachable(&self, grace: Duration) -> bool {
        let me = MeRef::new(ClassId::ONU2_G, 0);
        let sent = self
            .channel
            .send_with_callback(
                me,
                MessageBody::GetRequest {
                    mask: ONU2G_PROBE_ATTR_MASK,
                },
            )
            .await;
        let (tid, rx) = match sent {
            Ok(pair) => pair,
            Err(e) => {
                warn!(self.log, "probe could not be sent"; "error" => %e);
                return false;
            }
        };
        match timeout(grace, rx).await {
            Ok(Ok(message)) => {
                let ok = matches!(
                    &message.body,
                    MessageBody::GetResponse { result, .. } if result.is_success()
                );
                debug!(self.log, "probe answered"; "success" => ok);
                ok
            }
            _ => {
                self.channel.cancel(tid).await;
                debug!(self.log, "probe unanswered within grace period");
                false
            }
        }
    }

    /// Synchronize the mirror: reset the device's MIB, upload it, and
    /// replace the local copy. Returns the number of uploaded instances.
    pub async fn mib_sync(&self, bound: Duration) -> Result<usize, Error> {
        let onu_data = MeRef::new(ClassId::ONU_DATA, 0);
        self.channel
            .request(onu_data, MessageBody::MibResetRequest, bound)
            .await?;
        self.mib.write().await.clear();

        let uploaded = self
            .channel
            .request(onu_data, MessageBody::MibUploadRequest, bound)
            .await?;
        let MessageBody::MibUploadResponse { count } = uploaded.body else {
            return Err(Error::UnexpectedMessage(uploaded.kind()));
        };

        for seq in 0..count {
            let next = self
                .channel
                .request(onu_data, MessageBody::MibUploadNextRequest { seq }, bound)
                .await?;
            let MessageBody::MibUploadNextResponse { reported, attrs } = next.body else {
                return Err(Error::UnexpectedMessage(next.kind()));
            };
            self.mib.write().await.put(reported, &attrs);
        }
        let mirrored = self.mib.read().await.len();
        debug!(
            self.log,
            "mirror synchronized";
            "uploaded" => count,
            "mirrored" => mirrored,
        );
        Ok(usize::from(count))
    }
}
