// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Administrative lock and unlock of the device and its UNIs.
//!
//! Locking sets the ONU-G first so the device stops forwarding before its
//! ports go down; unlocking reverses the order. The two directions are
//! otherwise the same machine, so they share states and differ only in
//! their transition tables.

use crate::config::Config;
use crate::device::DeviceEvent;
use crate::fsm::AdapterFsm;
use crate::fsm::FsmHandle;
use crate::fsm::Transition;
use crate::omci::OmciChannel;
use crate::uni::OnuUniPort;
use crate::Error;
use omci_messages::me::AttrValue;
use omci_messages::me::Attribute;
use omci_messages::me::AttributeList;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;
use omci_messages::message::MessageBody;
use slog::debug;
use slog::error;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// States of the administrative state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disabled,
    Starting,
    SettingOnuG,
    SettingUnis,
    AdminDone,
    Resetting,
}

/// Events driving the administrative state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    StartAdmin,
    OnuGSet,
    UnisSet,
    Reset,
    Restart,
}

/// Locking goes device-first, ports second.
const LOCK_TRANSITIONS: &[Transition<State, Event>] = &[
    Transition {
        event: Event::Start,
        from: &[State::Disabled],
        to: State::Starting,
    },
    Transition {
        event: Event::StartAdmin,
        from: &[State::Starting],
        to: State::SettingOnuG,
    },
    Transition {
        event: Event::OnuGSet,
        from: &[State::SettingOnuG],
        to: State::SettingUnis,
    },
    Transition {
        event: Event::UnisSet,
        from: &[State::SettingUnis],
        to: State::AdminDone,
    },
    Transition {
        event: Event::Reset,
        from: &[
            State::Starting,
            State::SettingOnuG,
            State::SettingUnis,
            State::AdminDone,
        ],
        to: State::Resetting,
    },
    Transition {
        event: Event::Restart,
        from: &[State::Resetting],
        to: State::Disabled,
    },
];

/// Unlocking goes ports-first, device second.
const UNLOCK_TRANSITIONS: &[Transition<State, Event>] = &[
    Transition {
        event: Event::Start,
        from: &[State::Disabled],
        to: State::Starting,
    },
    Transition {
        event: Event::StartAdmin,
        from: &[State::Starting],
        to: State::SettingUnis,
    },
    Transition {
        event: Event::UnisSet,
        from: &[State::SettingUnis],
        to: State::SettingOnuG,
    },
    Transition {
        event: Event::OnuGSet,
        from: &[State::SettingOnuG],
        to: State::AdminDone,
    },
    Transition {
        event: Event::Reset,
        from: &[
            State::Starting,
            State::SettingOnuG,
            State::SettingUnis,
            State::AdminDone,
        ],
        to: State::Resetting,
    },
    Transition {
        event: Event::Restart,
        from: &[State::Resetting],
        to: State::Disabled,
    },
];

/// Which way the administrative state is being driven.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminDirection {
    Lock,
    Unlock,
}

impl AdminDirection {
    fn name(&self) -> &'static str {
        match self {
            AdminDirection::Lock => "uni-lock",
            AdminDirection::Unlock => "uni-unlock",
        }
    }

    /// The administrative-state attribute value: 1 locks, 0 unlocks.
    fn admin_value(&self) -> u8 {
        match self {
            AdminDirection::Lock => 1,
            AdminDirection::Unlock => 0,
        }
    }

    fn table(&self) -> &'static [Transition<State, Event>] {
        match self {
            AdminDirection::Lock => LOCK_TRANSITIONS,
            AdminDirection::Unlock => UNLOCK_TRANSITIONS,
        }
    }

    fn done_event(&self) -> DeviceEvent {
        match self {
            AdminDirection::Lock => DeviceEvent::UniLockDone,
            AdminDirection::Unlock => DeviceEvent::UniUnlockDone,
        }
    }
}

struct Runner {
    fsm: AdapterFsm<State, Event>,
    direction: AdminDirection,
    channel: Arc<OmciChannel>,
    unis: Vec<OnuUniPort>,
    events: mpsc::Sender<DeviceEvent>,
    response_timeout: Duration,
}

/// Start driving the device's administrative state in `direction`,
/// reporting completion as the direction's device event.
pub fn start(
    device_id: &str,
    direction: AdminDirection,
    channel: Arc<OmciChannel>,
    unis: Vec<OnuUniPort>,
    events: mpsc::Sender<DeviceEvent>,
    config: &Config,
    log: &Logger,
) -> FsmHandle<State> {
    let fsm = AdapterFsm::new(
        direction.name(),
        device_id,
        State::Disabled,
        direction.table(),
        config.fsm_queue_depth,
        log,
    );
    let tx = fsm.sender();
    let state = fsm.machine.watch();
    let runner = Runner {
        fsm,
        direction,
        channel,
        unis,
        events,
        response_timeout: config.response_timeout,
    };
    let task = tokio::spawn(runner.run());
    FsmHandle::new(tx, state, task)
}

impl Runner {
    async fn run(mut self) {
        let mut event = Event::Start;
        loop {
            let state = match self.fsm.machine.apply(event) {
                Ok(state) => state,
                Err(e) => {
                    error!(self.fsm.log(), "machine cannot continue"; "error" => %e);
                    return;
                }
            };
            let next = match self.on_enter(state).await {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        self.fsm.log(),
                        "admin step failed";
                        "state" => ?state,
                        "error" => %e,
                    );
                    match state {
                        State::Resetting | State::Disabled => None,
                        _ => Some(Event::Reset),
                    }
                }
            };
            match next {
                Some(next) => event = next,
                None => return,
            }
        }
    }

    async fn on_enter(&mut self, state: State) -> Result<Option<Event>, Error> {
        match state {
            State::Starting => Ok(Some(Event::StartAdmin)),
            State::SettingOnuG => {
                self.set_admin(MeRef::new(ClassId::ONU_G, 0)).await?;
                Ok(Some(Event::OnuGSet))
            }
            State::SettingUnis => {
                self.set_unis().await?;
                Ok(Some(Event::UnisSet))
            }
            State::AdminDone => {
                debug!(self.fsm.log(), "administrative change complete");
                if self.events.send(self.direction.done_event()).await.is_err() {
                    warn!(self.fsm.log(), "device event queue closed");
                }
                Ok(Some(Event::Reset))
            }
            State::Resetting => Ok(Some(Event::Restart)),
            State::Disabled => Ok(None),
        }
    }

    async fn set_unis(&mut self) -> Result<(), Error> {
        let unis = self.unis.clone();
        for port in unis.iter().filter(|p| p.enabled) {
            // Ports with no known backing class carry no admin state.
            let Some(me) = port.admin_me() else {
                continue;
            };
            self.set_admin(me).await?;
        }
        Ok(())
    }

    async fn set_admin(&mut self, me: MeRef) -> Result<(), Error> {
        let attrs = AttributeList::from_pairs(&[(
            Attribute::AdministrativeState,
            AttrValue::U8(self.direction.admin_value()),
        )])?;
        let queue = self.fsm.sender();
        let tid = self
            .channel
            .send_tracked(me, MessageBody::SetRequest { attrs }, &queue)
            .await?;
        match self.fsm.wait_response(me, self.response_timeout).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.channel.cancel(tid).await;
                Err(e)
            }
        }
    }
}
