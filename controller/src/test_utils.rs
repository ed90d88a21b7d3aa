// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Shared helpers for the crate's tests: a quiet logger, in-memory
//! collaborator doubles, and a transport reflector that plays the remote
//! device.

use crate::omci::OmciChannel;
use crate::proxy::ConnectState;
use crate::proxy::CoreProxy;
use crate::proxy::EventSink;
use crate::proxy::KvStore;
use crate::proxy::OnuActivatedEvent;
use crate::proxy::OnuStatus;
use crate::proxy::OnuStatusSource;
use crate::proxy::OperState;
use crate::proxy::PortDescriptor;
use crate::Error;
use omci_messages::me::AttributeList;
use omci_messages::message::Message;
use omci_messages::message::MessageBody;
use omci_messages::message::ResultCode;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// An in-memory [`KvStore`].
#[derive(Debug, Default)]
pub(crate) struct MemoryKvStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), Error> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, Error> {
        Ok(self
            .map
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<(), Error> {
        self.map
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// A [`CoreProxy`] that records every call it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingCoreProxy {
    pub states: Mutex<Vec<(ConnectState, OperState)>>,
    pub reasons: Mutex<Vec<String>>,
    pub ports: Mutex<Vec<PortDescriptor>>,
    pub port_states: Mutex<Vec<(u32, OperState)>>,
}

impl RecordingCoreProxy {
    pub fn last_reason(&self) -> Option<String> {
        self.reasons.lock().unwrap().last().cloned()
    }
}

impl CoreProxy for RecordingCoreProxy {
    fn device_state_update(
        &self,
        _device_id: &str,
        connect: ConnectState,
        oper: OperState,
    ) -> Result<(), Error> {
        self.states.lock().unwrap().push((connect, oper));
        Ok(())
    }

    fn device_reason_update(&self, _device_id: &str, reason: &str) -> Result<(), Error> {
        self.reasons.lock().unwrap().push(reason.to_string());
        Ok(())
    }

    fn port_created(&self, _device_id: &str, port: &PortDescriptor) -> Result<(), Error> {
        self.ports.lock().unwrap().push(port.clone());
        Ok(())
    }

    fn port_state_update(
        &self,
        _device_id: &str,
        port_no: u32,
        oper: OperState,
    ) -> Result<(), Error> {
        self.port_states.lock().unwrap().push((port_no, oper));
        Ok(())
    }
}

/// An [`EventSink`] that records activation events.
#[derive(Debug, Default)]
pub(crate) struct RecordingEventSink {
    pub events: Mutex<Vec<OnuActivatedEvent>>,
}

impl EventSink for RecordingEventSink {
    fn onu_activated(&self, event: &OnuActivatedEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// An [`OnuStatusSource`] serving a settable list.
#[derive(Debug, Default)]
pub(crate) struct StaticStatusSource {
    pub statuses: Mutex<Vec<OnuStatus>>,
}

impl StaticStatusSource {
    pub fn set(&self, statuses: Vec<OnuStatus>) {
        *self.statuses.lock().unwrap() = statuses;
    }
}

impl OnuStatusSource for StaticStatusSource {
    fn read_status_list(&self) -> Result<Vec<OnuStatus>, Error> {
        Ok(self.statuses.lock().unwrap().clone())
    }
}

/// Build the success response a well-behaved device would send for
/// `request`.
pub(crate) fn success_response(request: &Message) -> Message {
    let body = match &request.body {
        MessageBody::CreateRequest { .. } => MessageBody::CreateResponse {
            result: ResultCode::Success,
        },
        MessageBody::SetRequest { .. } => MessageBody::SetResponse {
            result: ResultCode::Success,
        },
        MessageBody::GetRequest { mask } => MessageBody::GetResponse {
            result: ResultCode::Success,
            mask: *mask,
            attrs: AttributeList::empty(),
        },
        MessageBody::DeleteRequest => MessageBody::DeleteResponse {
            result: ResultCode::Success,
        },
        MessageBody::MibResetRequest => MessageBody::MibResetResponse {
            result: ResultCode::Success,
        },
        MessageBody::MibUploadRequest => MessageBody::MibUploadResponse { count: 0 },
        MessageBody::MibUploadNextRequest { .. } => MessageBody::MibUploadNextResponse {
            reported: request.me,
            attrs: AttributeList::empty(),
        },
        MessageBody::RebootRequest => MessageBody::RebootResponse {
            result: ResultCode::Success,
        },
        other => panic!("reflector received a non-request body: {other:?}"),
    };
    Message::new(request.header.tid, request.me, body)
}

/// A task playing the remote device: it records each outbound request
/// and feeds a reply back through the channel's response path.
pub(crate) struct Reflector {
    pub requests: Arc<Mutex<Vec<Message>>>,
    task: JoinHandle<()>,
}

impl Drop for Reflector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Reflector {
    /// Count the recorded requests addressed to `class`.
    pub fn count_class(&self, class: omci_messages::me::ClassId) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.me.class == class)
            .count()
    }
}

/// Spawn a reflector that answers every request with a success response.
pub(crate) fn reflect_success(
    channel: Arc<OmciChannel>,
    transport_rx: mpsc::Receiver<Message>,
) -> Reflector {
    reflect_with(channel, transport_rx, |request| {
        Some(success_response(request))
    })
}

/// Spawn a reflector whose behavior is chosen per request; returning
/// `None` silently drops the request, like a device that never answers.
pub(crate) fn reflect_with<F>(
    channel: Arc<OmciChannel>,
    mut transport_rx: mpsc::Receiver<Message>,
    behavior: F,
) -> Reflector
where
    F: Fn(&Message) -> Option<Message> + Send + 'static,
{
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let task = tokio::spawn(async move {
        while let Some(request) = transport_rx.recv().await {
            let reply = behavior(&request);
            recorded.lock().unwrap().push(request);
            if let Some(reply) = reply {
                channel.handle_response(reply).await;
            }
        }
    });
    Reflector { requests, task }
}
