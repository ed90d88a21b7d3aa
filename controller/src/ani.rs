// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! ANI-side provisioning of one (UNI, technology profile) pair.
//!
//! This machine builds the upstream data path: an 802.1p mapper and its
//! ANI-side bridge port, the T-CONT alloc-id assignment, a GEM network
//! CTP and interworking TP per GEM port, priority-queue scheduling, and
//! finally the mapper's priority-to-GEM table.

use crate::config::Config;
use crate::device::DeviceEvent;
use crate::fsm::AdapterFsm;
use crate::fsm::FsmHandle;
use crate::fsm::Transition;
use crate::omci::OmciChannel;
use crate::tech_profile::PonAniConfig;
use crate::uni::OnuUniPort;
use crate::Error;
use crate::GAL_ETHERNET_EID;
use crate::IEEE_MAPPER_SERVICE_PROFILE_EID;
use crate::MAC_BRIDGE_PORT_ANI_EID;
use crate::MAC_BRIDGE_SERVICE_PROFILE_EID;
use crate::TRAFFIC_SCHEDULER_EID;
use crate::WEIGHT_STRICT_PRIORITY;
use omci_messages::me::AttrValue;
use omci_messages::me::Attribute;
use omci_messages::me::AttributeList;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;
use omci_messages::message::MessageBody;
use onu_mib::queues;
use onu_mib::MibDatabase;
use slog::debug;
use slog::error;
use slog::warn;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// GEM interworking option selecting IEEE 802.1p mapper interworking.
const INTERWORKING_8021P_MAPPER: u8 = 5;

/// Pointer value for an unclaimed slot of the mapper's priority table.
const NULL_POINTER: u16 = 0xffff;

/// ANI-side bridge ports are numbered clear of the UNI-side range.
const ANI_BRIDGE_PORT_BASE: u8 = 0xa0;

/// TP type code for an IEEE 802.1p mapper service profile.
const TP_TYPE_8021P_MAPPER: u8 = 3;

/// States of the ANI provisioning machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disabled,
    Starting,
    CreatingMapper,
    CreatingBridgePort,
    SettingTcont,
    CreatingGemCtps,
    CreatingGemInterworks,
    SettingQueues,
    SettingMapper,
    ConfigDone,
    Resetting,
}

/// Events driving the ANI provisioning machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    CreateMapper,
    MapperCreated,
    BridgePortCreated,
    TcontSet,
    GemCtpsCreated,
    GemInterworksCreated,
    QueuesSet,
    MapperSet,
    Reset,
    Restart,
}

const TRANSITIONS: &[Transition<State, Event>] = &[
    Transition {
        event: Event::Start,
        from: &[State::Disabled],
        to: State::Starting,
    },
    Transition {
        event: Event::CreateMapper,
        from: &[State::Starting],
        to: State::CreatingMapper,
    },
    Transition {
        event: Event::MapperCreated,
        from: &[State::CreatingMapper],
        to: State::CreatingBridgePort,
    },
    Transition {
        event: Event::BridgePortCreated,
        from: &[State::CreatingBridgePort],
        to: State::SettingTcont,
    },
    Transition {
        event: Event::TcontSet,
        from: &[State::SettingTcont],
        to: State::CreatingGemCtps,
    },
    Transition {
        event: Event::GemCtpsCreated,
        from: &[State::CreatingGemCtps],
        to: State::CreatingGemInterworks,
    },
    Transition {
        event: Event::GemInterworksCreated,
        from: &[State::CreatingGemInterworks],
        to: State::SettingQueues,
    },
    Transition {
        event: Event::QueuesSet,
        from: &[State::SettingQueues],
        to: State::SettingMapper,
    },
    Transition {
        event: Event::MapperSet,
        from: &[State::SettingMapper],
        to: State::ConfigDone,
    },
    Transition {
        event: Event::Reset,
        from: &[
            State::Starting,
            State::CreatingMapper,
            State::CreatingBridgePort,
            State::SettingTcont,
            State::CreatingGemCtps,
            State::CreatingGemInterworks,
            State::SettingQueues,
            State::SettingMapper,
            State::ConfigDone,
        ],
        to: State::Resetting,
    },
    Transition {
        event: Event::Restart,
        from: &[State::Resetting],
        to: State::Disabled,
    },
];

/// One GEM port with its queue pointers resolved against the mirror.
#[derive(Clone, Debug)]
struct GemAttribs {
    gem_id: u16,
    direction: u8,
    up_queue: u16,
    down_queue: u16,
    weight: u16,
    pbit_map: u8,
}

/// Entity ids and queue pointers derived once, on entry to `Starting`.
#[derive(Clone, Debug)]
struct Derived {
    tcont: u16,
    mapper_id: u16,
    bridge_port_id: u16,
    gems: Vec<GemAttribs>,
}

struct Runner {
    fsm: AdapterFsm<State, Event>,
    channel: Arc<OmciChannel>,
    uni: OnuUniPort,
    tp_id: u16,
    profile: PonAniConfig,
    db: MibDatabase,
    events: mpsc::Sender<DeviceEvent>,
    completion: Option<oneshot::Sender<bool>>,
    response_timeout: Duration,
    derived: Option<Derived>,
    done: bool,
}

/// Start ANI provisioning for one UNI, over a snapshot of the mirrored
/// database.
///
/// Completion is reported twice: as a [`DeviceEvent::OmciAniConfigDone`]
/// on success, and as a boolean on `completion` once the machine has
/// wound down either way.
#[allow(clippy::too_many_arguments)]
pub fn start(
    device_id: &str,
    channel: Arc<OmciChannel>,
    uni: OnuUniPort,
    tp_id: u16,
    profile: PonAniConfig,
    db: MibDatabase,
    events: mpsc::Sender<DeviceEvent>,
    completion: oneshot::Sender<bool>,
    settings: &Config,
    log: &Logger,
) -> FsmHandle<State> {
    let fsm = AdapterFsm::new(
        "ani-config",
        device_id,
        State::Disabled,
        TRANSITIONS,
        settings.fsm_queue_depth,
        log,
    );
    let tx = fsm.sender();
    let state = fsm.machine.watch();
    let runner = Runner {
        fsm,
        channel,
        uni,
        tp_id,
        profile,
        db,
        events,
        completion: Some(completion),
        response_timeout: settings.response_timeout,
        derived: None,
        done: false,
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
                        "provisioning step failed";
                        "state" => ?state,
                        "uni_id" => self.uni.uni_id,
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
            State::Starting => {
                self.derived = Some(self.derive()?);
                Ok(Some(Event::CreateMapper))
            }
            State::CreatingMapper => {
                let me = MeRef::new(
                    ClassId::IEEE_8021P_MAPPER_SERVICE_PROFILE,
                    self.derived()?.mapper_id,
                );
                // Created bare; the priority table is set once the GEM
                // ports backing it exist.
                self.transact(
                    me,
                    MessageBody::CreateRequest {
                        attrs: AttributeList::empty(),
                    },
                )
                .await?;
                Ok(Some(Event::MapperCreated))
            }
            State::CreatingBridgePort => {
                self.create_bridge_port().await?;
                Ok(Some(Event::BridgePortCreated))
            }
            State::SettingTcont => {
                let me = MeRef::new(ClassId::T_CONT, self.derived()?.tcont);
                let attrs = AttributeList::from_pairs(&[(
                    Attribute::AllocId,
                    AttrValue::U16(self.profile.alloc_id),
                )])?;
                self.transact(me, MessageBody::SetRequest { attrs }).await?;
                Ok(Some(Event::TcontSet))
            }
            State::CreatingGemCtps => {
                self.create_gem_ctps().await?;
                Ok(Some(Event::GemCtpsCreated))
            }
            State::CreatingGemInterworks => {
                self.create_gem_interworks().await?;
                Ok(Some(Event::GemInterworksCreated))
            }
            State::SettingQueues => {
                self.set_queues().await?;
                Ok(Some(Event::QueuesSet))
            }
            State::SettingMapper => {
                self.set_mapper().await?;
                Ok(Some(Event::MapperSet))
            }
            State::ConfigDone => {
                debug!(
                    self.fsm.log(),
                    "ANI provisioning complete";
                    "uni_id" => self.uni.uni_id,
                    "tp_id" => self.tp_id,
                );
                self.done = true;
                let event = DeviceEvent::OmciAniConfigDone {
                    uni_id: self.uni.uni_id,
                };
                if self.events.send(event).await.is_err() {
                    warn!(self.fsm.log(), "device event queue closed");
                }
                Ok(Some(Event::Reset))
            }
            State::Resetting => Ok(Some(Event::Restart)),
            State::Disabled => {
                if let Some(tx) = self.completion.take() {
                    let _ = tx.send(self.done);
                }
                Ok(None)
            }
        }
    }

    fn derived(&self) -> Result<&Derived, Error> {
        self.derived
            .as_ref()
            .ok_or(Error::Derivation("parameters not derived"))
    }

    /// Resolve entity ids and queue pointers from the mirror.
    ///
    /// The device decides how many T-CONTs exist and what their entity
    /// ids are; the lowest-numbered reported instance is used.
    fn derive(&self) -> Result<Derived, Error> {
        let tcont = self
            .db
            .first_instance(ClassId::T_CONT)
            .ok_or(Error::Derivation("device reports no T-CONT"))?;
        let mapper_id =
            IEEE_MAPPER_SERVICE_PROFILE_EID + u16::from(self.uni.mac_bp_no) + self.tp_id;
        let bridge_port_id = MAC_BRIDGE_PORT_ANI_EID + self.uni.entity_id + self.tp_id;
        let mut gems = Vec::with_capacity(self.profile.gem_ports.len());
        for gem in &self.profile.gem_ports {
            let up_queue = queues::upstream_queue(&self.db, tcont, gem.prio_queue_index)
                .ok_or(Error::Derivation("no matching upstream priority queue"))?;
            let down_queue =
                queues::downstream_queue(&self.db, self.uni.uni_id, gem.prio_queue_index)
                    .ok_or(Error::Derivation("no matching downstream priority queue"))?;
            gems.push(GemAttribs {
                gem_id: gem.gem_id,
                direction: gem.direction,
                up_queue,
                down_queue,
                weight: gem.weight,
                pbit_map: gem.pbit_map,
            });
        }
        Ok(Derived {
            tcont,
            mapper_id,
            bridge_port_id,
            gems,
        })
    }

    /// Send one tracked request and wait for its successful response.
    async fn transact(&mut self, me: MeRef, body: MessageBody) -> Result<(), Error> {
        let queue = self.fsm.sender();
        let tid = self.channel.send_tracked(me, body, &queue).await?;
        match self.fsm.wait_response(me, self.response_timeout).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.channel.cancel(tid).await;
                Err(e)
            }
        }
    }

    async fn create_bridge_port(&mut self) -> Result<(), Error> {
        let derived = self.derived()?.clone();
        let me = MeRef::new(ClassId::MAC_BRIDGE_PORT_CONFIG_DATA, derived.bridge_port_id);
        let attrs = AttributeList::from_pairs(&[
            (
                Attribute::BridgeIdPointer,
                AttrValue::U16(MAC_BRIDGE_SERVICE_PROFILE_EID + u16::from(self.uni.mac_bp_no)),
            ),
            (
                Attribute::PortNum,
                AttrValue::U8(ANI_BRIDGE_PORT_BASE + self.uni.uni_id),
            ),
            (Attribute::TpType, AttrValue::U8(TP_TYPE_8021P_MAPPER)),
            (Attribute::TpPointer, AttrValue::U16(derived.mapper_id)),
        ])?;
        self.transact(me, MessageBody::CreateRequest { attrs }).await
    }

    async fn create_gem_ctps(&mut self) -> Result<(), Error> {
        let derived = self.derived()?.clone();
        for gem in &derived.gems {
            let me = MeRef::new(ClassId::GEM_PORT_NETWORK_CTP, gem.gem_id);
            let attrs = AttributeList::from_pairs(&[
                (Attribute::PortId, AttrValue::U16(gem.gem_id)),
                (Attribute::TContPointer, AttrValue::U16(derived.tcont)),
                (Attribute::Direction, AttrValue::U8(gem.direction)),
                (
                    Attribute::TrafficManagementPointerUpstream,
                    AttrValue::U16(gem.up_queue),
                ),
                (
                    Attribute::PriorityQueuePointerDownstream,
                    AttrValue::U16(gem.down_queue),
                ),
            ])?;
            self.transact(me, MessageBody::CreateRequest { attrs }).await?;
        }
        Ok(())
    }

    async fn create_gem_interworks(&mut self) -> Result<(), Error> {
        let derived = self.derived()?.clone();
        for gem in &derived.gems {
            let me = MeRef::new(ClassId::GEM_INTERWORKING_TP, gem.gem_id);
            let attrs = AttributeList::from_pairs(&[
                (
                    Attribute::GemPortCtpConnectivityPointer,
                    AttrValue::U16(gem.gem_id),
                ),
                (
                    Attribute::InterworkingOption,
                    AttrValue::U8(INTERWORKING_8021P_MAPPER),
                ),
                (
                    Attribute::ServiceProfilePointer,
                    AttrValue::U16(derived.mapper_id),
                ),
                (Attribute::InterworkingTpPointer, AttrValue::U16(0)),
                (Attribute::GalProfilePointer, AttrValue::U16(GAL_ETHERNET_EID)),
            ])?;
            self.transact(me, MessageBody::CreateRequest { attrs }).await?;
        }
        Ok(())
    }

    /// Point each upstream queue at its scheduler.
    ///
    /// GEM ports sharing a priority share a queue; each queue is set at
    /// most once, in the order the profile first mentions it. A WRR
    /// weight holds only while no GEM port on the queue asks for strict
    /// priority; strict priority always wins the merge.
    async fn set_queues(&mut self) -> Result<(), Error> {
        let derived = self.derived()?.clone();
        let mut queues: Vec<(u16, u16)> = Vec::new();
        for gem in &derived.gems {
            match queues.iter_mut().find(|(queue, _)| *queue == gem.up_queue) {
                Some(entry) => {
                    if gem.weight == WEIGHT_STRICT_PRIORITY {
                        entry.1 = WEIGHT_STRICT_PRIORITY;
                    }
                }
                None => queues.push((gem.up_queue, gem.weight)),
            }
        }
        for (queue, weight) in queues {
            let me = MeRef::new(ClassId::PRIORITY_QUEUE, queue);
            let attrs = if weight == WEIGHT_STRICT_PRIORITY {
                AttributeList::from_pairs(&[(
                    Attribute::TrafficSchedulerPointer,
                    AttrValue::U16(0),
                )])?
            } else {
                AttributeList::from_pairs(&[
                    (
                        Attribute::TrafficSchedulerPointer,
                        AttrValue::U16(TRAFFIC_SCHEDULER_EID),
                    ),
                    (
                        Attribute::Weight,
                        AttrValue::U8(u8::try_from(weight).unwrap_or(u8::MAX)),
                    ),
                ])?
            };
            self.transact(me, MessageBody::SetRequest { attrs }).await?;
        }
        Ok(())
    }

    /// Fill in the mapper's priority-to-GEM table.
    ///
    /// Each priority slot goes to the first GEM port claiming that bit;
    /// unclaimed slots carry the null pointer. A profile claiming no bit
    /// at all is a provisioning error.
    async fn set_mapper(&mut self) -> Result<(), Error> {
        let derived = self.derived()?.clone();
        let mut table = [None; 8];
        for gem in &derived.gems {
            for (prio, slot) in table.iter_mut().enumerate() {
                if slot.is_none() && gem.pbit_map & (1 << prio) != 0 {
                    *slot = Some(gem.gem_id);
                }
            }
        }
        if table.iter().all(Option::is_none) {
            return Err(Error::Derivation("profile claims no priority bits"));
        }

        let me = MeRef::new(ClassId::IEEE_8021P_MAPPER_SERVICE_PROFILE, derived.mapper_id);
        let mut attrs = AttributeList::empty();
        for (prio, slot) in table.iter().enumerate() {
            attrs.push(
                Attribute::InterworkTpPointerForPBitPriority(prio as u8),
                AttrValue::U16(slot.unwrap_or(NULL_POINTER)),
            )?;
        }
        self.transact(me, MessageBody::SetRequest { attrs }).await
    }
}
