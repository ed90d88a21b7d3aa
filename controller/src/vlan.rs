// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Per-UNI VLAN filtering.
//!
//! One machine exists per UNI at most. It parks until the UNI's
//! technology profile has been provisioned, then installs the VLAN
//! tagging filter (when a specific VLAN is matched) and shapes the UNI's
//! extended VLAN tagging instance with the treatment rule.

use crate::config::Config;
use crate::device::DeviceEvent;
use crate::flows::VlanFlowParams;
use crate::fsm::AdapterFsm;
use crate::fsm::FsmHandle;
use crate::fsm::Transition;
use crate::messages::FsmMessage;
use crate::omci::OmciChannel;
use crate::uni::OnuUniPort;
use crate::Error;
use crate::MAC_BRIDGE_SERVICE_PROFILE_EID;
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

/// Priority-filter code meaning "there is no tag at this level".
const PRIO_IGNORE_TAG: u8 = 15;

/// Priority-filter code marking the default (lowest-precedence) rule.
const PRIO_DEFAULT_FILTER: u8 = 14;

/// Priority-filter code meaning "match any priority".
const PRIO_DO_NOT_FILTER: u8 = 8;

/// Treatment-priority code meaning "copy from the filtered tag".
const PRIO_COPY_FROM_INNER: u8 = 8;

/// Treatment-TPID code meaning "copy TPID and DE from the inner tag".
const TPID_COPY_FROM_INNER: u8 = 4;

/// VID wildcard in filter fields.
const VID_ANY: u16 = 4096;

/// Forward-operation code for VID-based bridging.
const FORWARD_OP_VID: u8 = 0x10;

/// The 802.1Q TPID written to both directions of the tagging instance.
const TPID_8021Q: u16 = 0x8100;

/// States of the VLAN filter machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disabled,
    Starting,
    WaitingTechProfile,
    CreatingFilter,
    SettingEvtocd,
    ConfigDone,
    Resetting,
}

/// Events driving the VLAN filter machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    WaitTechProfile,
    ContinueConfig,
    FilterCreated,
    EvtocdSet,
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
        event: Event::WaitTechProfile,
        from: &[State::Starting],
        to: State::WaitingTechProfile,
    },
    Transition {
        event: Event::ContinueConfig,
        from: &[State::Starting, State::WaitingTechProfile],
        to: State::CreatingFilter,
    },
    Transition {
        event: Event::FilterCreated,
        from: &[State::CreatingFilter],
        to: State::SettingEvtocd,
    },
    Transition {
        event: Event::EvtocdSet,
        from: &[State::SettingEvtocd],
        to: State::ConfigDone,
    },
    Transition {
        event: Event::Reset,
        from: &[
            State::Starting,
            State::WaitingTechProfile,
            State::CreatingFilter,
            State::SettingEvtocd,
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

/// Encode one received-frame VLAN tagging treatment rule.
///
/// The rule is four big-endian words: outer filter, inner filter, outer
/// treatment, inner treatment. Only single-tagged and untagged handling
/// is expressed here; the outer tag is never filtered or added.
pub fn tag_rule(params: &VlanFlowParams) -> [u8; 16] {
    let outer_filter = u32::from(PRIO_IGNORE_TAG) << 28 | u32::from(VID_ANY) << 15;
    let inner_filter = match params.match_vlan {
        Some(vid) => u32::from(PRIO_DO_NOT_FILTER) << 28 | u32::from(vid & 0x0fff) << 15,
        None => u32::from(PRIO_DEFAULT_FILTER) << 28 | u32::from(VID_ANY) << 15,
    };
    let (remove, inner_treatment) = match params.set_vlan {
        None => (0u32, u32::from(PRIO_IGNORE_TAG) << 16),
        Some(vid) => {
            let remove = u32::from(params.match_vlan.is_some());
            let prio = params.pcp.unwrap_or(PRIO_COPY_FROM_INNER);
            let treatment = u32::from(prio) << 16
                | u32::from(vid & 0x0fff) << 3
                | u32::from(TPID_COPY_FROM_INNER);
            (remove, treatment)
        }
    };
    let outer_treatment = remove << 30 | u32::from(PRIO_IGNORE_TAG) << 16;

    let mut rule = [0u8; 16];
    for (chunk, word) in rule
        .chunks_exact_mut(4)
        .zip([outer_filter, inner_filter, outer_treatment, inner_treatment])
    {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    rule
}

struct Runner {
    fsm: AdapterFsm<State, Event>,
    channel: Arc<OmciChannel>,
    uni: OnuUniPort,
    params: VlanFlowParams,
    tech_profile_ready: bool,
    events: mpsc::Sender<DeviceEvent>,
    response_timeout: Duration,
}

/// Start the VLAN filter machine for one UNI.
///
/// If `tech_profile_ready` is false the machine parks until a
/// [`FsmMessage::Proceed`] arrives on its queue. Completion is reported
/// as a [`DeviceEvent::OmciVlanFilterDone`].
pub fn start(
    device_id: &str,
    channel: Arc<OmciChannel>,
    uni: OnuUniPort,
    params: VlanFlowParams,
    tech_profile_ready: bool,
    events: mpsc::Sender<DeviceEvent>,
    config: &Config,
    log: &Logger,
) -> FsmHandle<State> {
    let fsm = AdapterFsm::new(
        "vlan-filter",
        device_id,
        State::Disabled,
        TRANSITIONS,
        config.fsm_queue_depth,
        log,
    );
    let tx = fsm.sender();
    let state = fsm.machine.watch();
    let runner = Runner {
        fsm,
        channel,
        uni,
        params,
        tech_profile_ready,
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
                        "filter step failed";
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
                if self.tech_profile_ready {
                    Ok(Some(Event::ContinueConfig))
                } else {
                    Ok(Some(Event::WaitTechProfile))
                }
            }
            State::WaitingTechProfile => {
                // Parked without a bound: the dependency may take as
                // long as the orchestration system takes to deliver it.
                loop {
                    match self.fsm.next_message(None).await? {
                        FsmMessage::Proceed => return Ok(Some(Event::ContinueConfig)),
                        FsmMessage::Abort => return Err(Error::Aborted),
                        FsmMessage::Response(message) => {
                            debug!(
                                self.fsm.log(),
                                "dropping response while parked";
                                "me" => %message.me,
                            );
                        }
                    }
                }
            }
            State::CreatingFilter => {
                self.create_filter().await?;
                Ok(Some(Event::FilterCreated))
            }
            State::SettingEvtocd => {
                self.set_evtocd().await?;
                Ok(Some(Event::EvtocdSet))
            }
            State::ConfigDone => {
                debug!(
                    self.fsm.log(),
                    "VLAN filter installed";
                    "uni_id" => self.uni.uni_id,
                );
                let event = DeviceEvent::OmciVlanFilterDone {
                    uni_id: self.uni.uni_id,
                };
                if self.events.send(event).await.is_err() {
                    warn!(self.fsm.log(), "device event queue closed");
                }
                Ok(Some(Event::Reset))
            }
            State::Resetting => Ok(Some(Event::Restart)),
            State::Disabled => Ok(None),
        }
    }

    async fn create_filter(&mut self) -> Result<(), Error> {
        let Some(vid) = self.params.match_vlan else {
            debug!(self.fsm.log(), "transparent flow, no tagging filter");
            return Ok(());
        };
        let me = MeRef::new(
            ClassId::VLAN_TAGGING_FILTER_DATA,
            MAC_BRIDGE_SERVICE_PROFILE_EID + u16::from(self.uni.mac_bp_no),
        );
        let mut vids = [0u16; 12];
        vids[0] = vid & 0x0fff;
        let attrs = AttributeList::from_pairs(&[
            (Attribute::VlanFilterList, AttrValue::VidList(vids)),
            (Attribute::ForwardOperation, AttrValue::U8(FORWARD_OP_VID)),
            (Attribute::NumberOfEntries, AttrValue::U8(1)),
        ])?;
        self.transact(me, MessageBody::CreateRequest { attrs }).await
    }

    /// Prime the tagging instance (TPIDs, downstream inversion mode),
    /// then write the treatment rule.
    async fn set_evtocd(&mut self) -> Result<(), Error> {
        let me = MeRef::new(
            ClassId::EXTENDED_VLAN_TAGGING_OPERATION_CONFIG_DATA,
            self.uni.entity_id,
        );
        let attrs = AttributeList::from_pairs(&[
            (Attribute::InputTpid, AttrValue::U16(TPID_8021Q)),
            (Attribute::OutputTpid, AttrValue::U16(TPID_8021Q)),
            (Attribute::DownstreamMode, AttrValue::U8(0)),
        ])?;
        self.transact(me, MessageBody::SetRequest { attrs }).await?;

        let attrs = AttributeList::from_pairs(&[(
            Attribute::ReceivedFrameVlanTaggingOperationTable,
            AttrValue::TagRule(tag_rule(&self.params)),
        )])?;
        self.transact(me, MessageBody::SetRequest { attrs }).await
    }

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
}
