// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The per-device management channel and its response correlation.
//!
//! Every outbound request gets a transaction id and a route describing
//! who is waiting for the answer: a one-shot callback, or the queue of
//! the configuration machine that sent it, tagged with the managed-entity
//! instance it addressed. A response is delivered only if its transaction
//! id has a route *and*, for machine routes, its (class, instance) pair
//! matches the instance recorded at send time. Anything else is dropped
//! with a diagnostic.

use crate::messages::FsmMessage;
use crate::Error;
use omci_messages::me::MeRef;
use omci_messages::message::Message;
use omci_messages::message::MessageBody;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Who is waiting on an outstanding transaction.
enum Route {
    /// A registered one-shot callback, e.g. the reachability probe.
    Callback(oneshot::Sender<Message>),
    /// A configuration machine's queue, tagged with the instance it
    /// last transmitted to on this exchange.
    Fsm {
        me: MeRef,
        queue: mpsc::Sender<FsmMessage>,
    },
}

/// Counters kept by the channel, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub rx_unmatched: u64,
}

/// The management channel of one device.
pub struct OmciChannel {
    log: Logger,
    next_tid: AtomicU16,
    routes: Mutex<HashMap<u16, Route>>,
    transport: mpsc::Sender<Message>,
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
    rx_unmatched: AtomicU64,
}

impl OmciChannel {
    pub fn new(device_id: &str, transport: mpsc::Sender<Message>, log: &Logger) -> Self {
        Self {
            log: log.new(o!("channel" => "omci", "device_id" => device_id.to_string())),
            next_tid: AtomicU16::new(1),
            routes: Mutex::new(HashMap::new()),
            transport,
            tx_frames: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
            rx_unmatched: AtomicU64::new(0),
        }
    }

    /// Assign the next transaction id, skipping the reserved zero.
    fn assign_tid(&self) -> u16 {
        loop {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if tid != 0 {
                return tid;
            }
        }
    }

    async fn send(&self, tid: u16, me: MeRef, body: MessageBody, route: Route) -> Result<(), Error> {
        let message = Message::new(tid, me, body);
        self.routes.lock().await.insert(tid, route);
        if self.transport.send(message).await.is_err() {
            self.routes.lock().await.remove(&tid);
            return Err(Error::TransportClosed);
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        debug!(self.log, "request sent"; "tid" => tid, "me" => %me);
        Ok(())
    }

    /// Send a request whose response is delivered on a one-shot channel.
    pub async fn send_with_callback(
        &self,
        me: MeRef,
        body: MessageBody,
    ) -> Result<(u16, oneshot::Receiver<Message>), Error> {
        let tid = self.assign_tid();
        let (tx, rx) = oneshot::channel();
        self.send(tid, me, body, Route::Callback(tx)).await?;
        Ok((tid, rx))
    }

    /// Send a request on behalf of a configuration machine. The response
    /// will be delivered on `queue` once its (class, instance) pair is
    /// verified against `me`.
    pub async fn send_tracked(
        &self,
        me: MeRef,
        body: MessageBody,
        queue: &mpsc::Sender<FsmMessage>,
    ) -> Result<u16, Error> {
        let tid = self.assign_tid();
        self.send(
            tid,
            me,
            body,
            Route::Fsm {
                me,
                queue: queue.clone(),
            },
        )
        .await?;
        Ok(tid)
    }

    /// Send a request and wait for its successful response.
    pub async fn request(
        &self,
        me: MeRef,
        body: MessageBody,
        bound: Duration,
    ) -> Result<Message, Error> {
        let (tid, rx) = self.send_with_callback(me, body).await?;
        let message = match timeout(bound, rx).await {
            Err(_) => {
                self.cancel(tid).await;
                return Err(Error::Timeout("omci request"));
            }
            Ok(Err(_)) => return Err(Error::Aborted),
            Ok(Ok(message)) => message,
        };
        if let Some(result) = message.body.result() {
            if !result.is_success() {
                return Err(Error::RequestFailed { me, result });
            }
        }
        Ok(message)
    }

    /// Forget an outstanding transaction, e.g. after its wait timed out.
    pub async fn cancel(&self, tid: u16) {
        self.routes.lock().await.remove(&tid);
    }

    /// Dispatch an inbound frame to whoever is waiting for it.
    pub async fn handle_response(&self, message: Message) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
        let tid = message.header.tid;
        if !message.is_response() {
            self.drop_unmatched(&message, "not a response");
            return;
        }

        let route = {
            let mut routes = self.routes.lock().await;
            match routes.get(&tid) {
                None => {
                    drop(routes);
                    self.drop_unmatched(&message, "no outstanding transaction");
                    return;
                }
                Some(Route::Fsm { me, .. }) if message.me != *me => {
                    // The request for this tid is still outstanding; leave
                    // its route in place.
                    warn!(
                        self.log,
                        "response instance does not match last transmitted instance";
                        "tid" => tid,
                        "expected" => %me,
                        "received" => %message.me,
                    );
                    self.rx_unmatched.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Some(_) => match routes.remove(&tid) {
                    Some(route) => route,
                    None => return,
                },
            }
        };

        match route {
            Route::Callback(tx) => {
                if tx.send(message).is_err() {
                    debug!(self.log, "response callback dropped"; "tid" => tid);
                }
            }
            Route::Fsm { queue, .. } => {
                if queue.send(FsmMessage::Response(message)).await.is_err() {
                    debug!(self.log, "response queue closed"; "tid" => tid);
                }
            }
        }
    }

    fn drop_unmatched(&self, message: &Message, why: &'static str) {
        self.rx_unmatched.fetch_add(1, Ordering::Relaxed);
        warn!(
            self.log,
            "dropping frame";
            "reason" => why,
            "tid" => message.header.tid,
            "kind" => ?message.kind(),
            "me" => %message.me,
        );
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_unmatched: self.rx_unmatched.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) async fn outstanding(&self) -> usize {
        self.routes.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use omci_messages::me::AttributeList;
    use omci_messages::me::ClassId;
    use omci_messages::message::ResultCode;

    fn channel() -> (OmciChannel, mpsc::Receiver<Message>) {
        let log = test_utils::test_logger();
        let (tx, rx) = mpsc::channel(8);
        (OmciChannel::new("dev", tx, &log), rx)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (channel, mut transport_rx) = channel();
        let me = MeRef::new(ClassId::ONU2_G, 0);

        let (tid, rx) = channel
            .send_with_callback(me, MessageBody::GetRequest { mask: 0xe000 })
            .await
            .unwrap();
        let sent = transport_rx.recv().await.unwrap();
        assert_eq!(sent.header.tid, tid);
        assert_eq!(sent.me, me);

        channel
            .handle_response(Message::new(
                tid,
                me,
                MessageBody::GetResponse {
                    result: ResultCode::Success,
                    mask: 0xe000,
                    attrs: AttributeList::empty(),
                },
            ))
            .await;
        let response = rx.await.unwrap();
        assert_eq!(response.header.tid, tid);
        assert_eq!(channel.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_tracked_response_requires_instance_match() {
        let (channel, mut transport_rx) = channel();
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let me = MeRef::new(ClassId::GAL_ETHERNET_PROFILE, 1);

        let tid = channel
            .send_tracked(
                me,
                MessageBody::CreateRequest {
                    attrs: AttributeList::empty(),
                },
                &queue_tx,
            )
            .await
            .unwrap();
        let _ = transport_rx.recv().await.unwrap();

        // A response with the right tid but the wrong instance is dropped
        // and the transaction stays outstanding.
        channel
            .handle_response(Message::new(
                tid,
                MeRef::new(ClassId::ONU2_G, 0),
                MessageBody::CreateResponse {
                    result: ResultCode::Success,
                },
            ))
            .await;
        assert!(queue_rx.try_recv().is_err());
        assert_eq!(channel.outstanding().await, 1);

        channel
            .handle_response(Message::new(
                tid,
                me,
                MessageBody::CreateResponse {
                    result: ResultCode::Success,
                },
            ))
            .await;
        match queue_rx.recv().await.unwrap() {
            FsmMessage::Response(message) => assert_eq!(message.me, me),
            other => panic!("unexpected queue message: {other:?}"),
        }
        assert_eq!(channel.outstanding().await, 0);
        assert_eq!(channel.stats().rx_unmatched, 1);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_dropped() {
        let (channel, _transport_rx) = channel();
        channel
            .handle_response(Message::new(
                42,
                MeRef::new(ClassId::ONU_G, 0),
                MessageBody::SetResponse {
                    result: ResultCode::Success,
                },
            ))
            .await;
        assert_eq!(channel.stats().rx_unmatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_cancels_route() {
        let (channel, _transport_rx) = channel();
        let me = MeRef::new(ClassId::ONU_G, 0);
        let err = channel
            .request(me, MessageBody::RebootRequest, Duration::from_secs(10))
            .await;
        assert!(matches!(err, Err(Error::Timeout(_))));
        assert_eq!(channel.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_tid_assignment_skips_zero() {
        let (channel, _transport_rx) = channel();
        channel.next_tid.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(channel.assign_tid(), u16::MAX);
        // Wraps past the reserved zero.
        assert_eq!(channel.assign_tid(), 1);
    }
}
