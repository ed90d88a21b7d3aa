// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The actor substrate: a declarative state machine paired with an
//! inbound message queue.
//!
//! Each configuration machine is a [`Machine`] (an enum-keyed transition
//! table) owned by a driver task. Entry actions never inject events into
//! their own machine; they *return* the next event, and the driver applies
//! it after the action completes. That rule is what makes the transition
//! engine safely non-reentrant.

use crate::messages::FsmMessage;
use crate::Error;
use omci_messages::me::MeRef;
use omci_messages::message::Message;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::timeout;

/// One row of a transition table: `event` moves the machine from any of
/// `from` to `to`.
#[derive(Clone, Copy, Debug)]
pub struct Transition<S: 'static, E> {
    pub event: E,
    pub from: &'static [S],
    pub to: S,
}

/// An enum-keyed state machine.
///
/// Applying an event the table does not allow from the current state is
/// an error, never a silent no-op.
pub struct Machine<S: 'static, E: 'static> {
    name: &'static str,
    state: S,
    table: &'static [Transition<S, E>],
    state_tx: watch::Sender<S>,
    log: Logger,
}

impl<S, E> Machine<S, E>
where
    S: Copy + Debug + PartialEq + Send + Sync,
    E: Copy + Debug + PartialEq,
{
    pub fn new(
        name: &'static str,
        device_id: &str,
        initial: S,
        table: &'static [Transition<S, E>],
        log: &Logger,
    ) -> Self {
        let log = log.new(o!(
            "fsm" => name,
            "device_id" => device_id.to_string(),
        ));
        let (state_tx, _) = watch::channel(initial);
        Self {
            name,
            state: initial,
            table,
            state_tx,
            log,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// A watch mirroring the current state, for observers outside the
    /// driver task.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.state_tx.subscribe()
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// True if `event` is legal from the current state.
    pub fn can(&self, event: E) -> bool {
        self.table
            .iter()
            .any(|t| t.event == event && t.from.contains(&self.state))
    }

    /// Apply `event`, returning the state entered.
    pub fn apply(&mut self, event: E) -> Result<S, Error> {
        let Some(transition) = self
            .table
            .iter()
            .find(|t| t.event == event && t.from.contains(&self.state))
        else {
            return Err(Error::IllegalTransition {
                fsm: self.name,
                state: format!("{:?}", self.state),
                event: format!("{event:?}"),
            });
        };
        debug!(
            self.log,
            "state transition";
            "from" => ?self.state,
            "event" => ?event,
            "to" => ?transition.to,
        );
        self.state = transition.to;
        self.state_tx.send_replace(self.state);
        Ok(self.state)
    }
}

/// A [`Machine`] bound to a named inbound message queue.
pub struct AdapterFsm<S: 'static, E: 'static> {
    pub machine: Machine<S, E>,
    rx: mpsc::Receiver<FsmMessage>,
    tx: mpsc::Sender<FsmMessage>,
}

impl<S, E> AdapterFsm<S, E>
where
    S: Copy + Debug + PartialEq + Send + Sync,
    E: Copy + Debug + PartialEq,
{
    pub fn new(
        name: &'static str,
        device_id: &str,
        initial: S,
        table: &'static [Transition<S, E>],
        queue_depth: usize,
        log: &Logger,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        Self {
            machine: Machine::new(name, device_id, initial, table, log),
            rx,
            tx,
        }
    }

    /// A handle for delivering messages onto this machine's queue.
    pub fn sender(&self) -> mpsc::Sender<FsmMessage> {
        self.tx.clone()
    }

    pub fn log(&self) -> &Logger {
        self.machine.log()
    }

    /// Receive the next queue message, bounded by `bound` if given.
    ///
    /// A closed queue is reported as an abort: every sender is gone, so
    /// nothing can arrive and the machine should wind down.
    pub async fn next_message(&mut self, bound: Option<Duration>) -> Result<FsmMessage, Error> {
        let received = match bound {
            None => self.rx.recv().await,
            Some(d) => timeout(d, self.rx.recv())
                .await
                .map_err(|_| Error::Timeout(self.machine.name()))?,
        };
        received.ok_or(Error::Aborted)
    }

    /// Wait for a successful response addressed to `me`.
    ///
    /// Responses for any other instance are dropped with a diagnostic and
    /// the wait continues; a non-success result code or an abort ends it.
    pub async fn wait_response(&mut self, me: MeRef, bound: Duration) -> Result<Message, Error> {
        loop {
            match self.next_message(Some(bound)).await? {
                FsmMessage::Response(message) => {
                    if message.me != me {
                        warn!(
                            self.log(),
                            "dropping response for unexpected instance";
                            "expected" => %me,
                            "received" => %message.me,
                        );
                        continue;
                    }
                    if let Some(result) = message.body.result() {
                        if !result.is_success() {
                            return Err(Error::RequestFailed { me, result });
                        }
                    }
                    return Ok(message);
                }
                FsmMessage::Proceed => {
                    debug!(self.log(), "ignoring proceed while awaiting response");
                }
                FsmMessage::Abort => return Err(Error::Aborted),
            }
        }
    }
}

/// A handle to a running configuration machine: its queue, a mirror of
/// its state, and the driver task itself.
///
/// Dropping the handle aborts the driver task.
pub struct FsmHandle<S> {
    tx: mpsc::Sender<FsmMessage>,
    state: watch::Receiver<S>,
    task: tokio::task::JoinHandle<()>,
}

impl<S: Copy> FsmHandle<S> {
    pub fn new(
        tx: mpsc::Sender<FsmMessage>,
        state: watch::Receiver<S>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self { tx, state, task }
    }

    /// The machine's current state.
    pub fn state(&self) -> S {
        *self.state.borrow()
    }

    /// True once the driver task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn sender(&self) -> mpsc::Sender<FsmMessage> {
        self.tx.clone()
    }

    /// Ask the machine to stop processing and reset.
    pub async fn abort(&self) {
        let _ = self.tx.send(FsmMessage::Abort).await;
    }

    /// Wait until the driver task has ended.
    pub async fn finished(&mut self) {
        let _ = (&mut self.task).await;
    }
}

impl<S> Drop for FsmHandle<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
