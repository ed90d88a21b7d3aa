// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The initial MIB-download machine.
//!
//! After MIB synchronization completes, this machine pushes the baseline
//! configuration the rest of provisioning builds on: the GAL Ethernet
//! profile, the ONU2-G connectivity mode, and one MAC bridge (service
//! profile, bridge port, extended VLAN tagging instance) per UNI.

use crate::config::Config;
use crate::device::DeviceEvent;
use crate::fsm::AdapterFsm;
use crate::fsm::FsmHandle;
use crate::fsm::Transition;
use crate::omci::OmciChannel;
use crate::uni::OnuUniPort;
use crate::uni::UniKind;
use crate::Error;
use crate::GAL_ETHERNET_EID;
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

/// GEM payload size set on the GAL Ethernet profile.
const GAL_MAX_GEM_PAYLOAD: u16 = 48;

/// States of the download machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Disabled,
    Starting,
    CreatingGal,
    SettingOnu2g,
    BridgeInit,
    Downloaded,
    Resetting,
}

/// Events driving the download machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    CreateGal,
    GalCreated,
    Onu2gSet,
    BridgesCreated,
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
        event: Event::CreateGal,
        from: &[State::Starting],
        to: State::CreatingGal,
    },
    Transition {
        event: Event::GalCreated,
        from: &[State::CreatingGal],
        to: State::SettingOnu2g,
    },
    Transition {
        event: Event::Onu2gSet,
        from: &[State::SettingOnu2g],
        to: State::BridgeInit,
    },
    Transition {
        event: Event::BridgesCreated,
        from: &[State::BridgeInit],
        to: State::Downloaded,
    },
    Transition {
        event: Event::Reset,
        from: &[
            State::Starting,
            State::CreatingGal,
            State::SettingOnu2g,
            State::BridgeInit,
            State::Downloaded,
        ],
        to: State::Resetting,
    },
    Transition {
        event: Event::Restart,
        from: &[State::Resetting],
        to: State::Disabled,
    },
];

struct Runner {
    fsm: AdapterFsm<State, Event>,
    channel: Arc<OmciChannel>,
    unis: Vec<OnuUniPort>,
    events: mpsc::Sender<DeviceEvent>,
    response_timeout: Duration,
}

/// Start the download machine over `unis`, reporting completion as a
/// [`DeviceEvent::MibDownloadDone`].
pub fn start(
    device_id: &str,
    channel: Arc<OmciChannel>,
    unis: Vec<OnuUniPort>,
    events: mpsc::Sender<DeviceEvent>,
    config: &Config,
    log: &Logger,
) -> FsmHandle<State> {
    let fsm = AdapterFsm::new(
        "mib-download",
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
                        "download step failed";
                        "state" => ?state,
                        "error" => %e,
                    );
                    match state {
                        // Already winding down; stop driving.
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
            State::Starting => Ok(Some(Event::CreateGal)),
            State::CreatingGal => {
                self.create_gal().await?;
                Ok(Some(Event::GalCreated))
            }
            State::SettingOnu2g => {
                self.set_onu2g().await?;
                Ok(Some(Event::Onu2gSet))
            }
            State::BridgeInit => {
                self.create_bridges().await?;
                Ok(Some(Event::BridgesCreated))
            }
            State::Downloaded => {
                debug!(self.fsm.log(), "initial download complete");
                if self.events.send(DeviceEvent::MibDownloadDone).await.is_err() {
                    warn!(self.fsm.log(), "device event queue closed");
                }
                Ok(Some(Event::Reset))
            }
            State::Resetting => Ok(Some(Event::Restart)),
            State::Disabled => Ok(None),
        }
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

    async fn create_gal(&mut self) -> Result<(), Error> {
        let me = MeRef::new(ClassId::GAL_ETHERNET_PROFILE, GAL_ETHERNET_EID);
        let attrs = AttributeList::from_pairs(&[(
            Attribute::MaxGemPayloadSize,
            AttrValue::U16(GAL_MAX_GEM_PAYLOAD),
        )])?;
        self.transact(me, MessageBody::CreateRequest { attrs }).await
    }

    async fn set_onu2g(&mut self) -> Result<(), Error> {
        let me = MeRef::new(ClassId::ONU2_G, 0);
        let attrs = AttributeList::from_pairs(&[(
            Attribute::CurrentConnectivityMode,
            AttrValue::U8(0),
        )])?;
        self.transact(me, MessageBody::SetRequest { attrs }).await
    }

    /// Create the MAC bridge for each UNI: service profile, UNI-side
    /// bridge port, and the extended VLAN tagging instance later shaped
    /// by the VLAN filter machine.
    async fn create_bridges(&mut self) -> Result<(), Error> {
        // Take a snapshot so &mut self stays available for transact().
        let unis = self.unis.clone();
        for port in unis.iter().filter(|p| p.kind != UniKind::Unknown) {
            let bridge_eid = MAC_BRIDGE_SERVICE_PROFILE_EID + u16::from(port.mac_bp_no);
            let (tp_type, association_type) = match port.kind {
                UniKind::Pptp => (1u8, 2u8),
                UniKind::Veip => (11u8, 10u8),
                UniKind::Unknown => continue,
            };

            let bridge = MeRef::new(ClassId::MAC_BRIDGE_SERVICE_PROFILE, bridge_eid);
            self.transact(
                bridge,
                MessageBody::CreateRequest {
                    attrs: AttributeList::empty(),
                },
            )
            .await?;

            let bridge_port = MeRef::new(ClassId::MAC_BRIDGE_PORT_CONFIG_DATA, bridge_eid);
            let attrs = AttributeList::from_pairs(&[
                (Attribute::BridgeIdPointer, AttrValue::U16(bridge_eid)),
                (Attribute::PortNum, AttrValue::U8(port.mac_bp_no)),
                (Attribute::TpType, AttrValue::U8(tp_type)),
                (Attribute::TpPointer, AttrValue::U16(port.entity_id)),
            ])?;
            self.transact(bridge_port, MessageBody::CreateRequest { attrs })
                .await?;

            let evtocd = MeRef::new(
                ClassId::EXTENDED_VLAN_TAGGING_OPERATION_CONFIG_DATA,
                port.entity_id,
            );
            let attrs = AttributeList::from_pairs(&[
                (Attribute::AssociationType, AttrValue::U8(association_type)),
                (
                    Attribute::AssociatedMePointer,
                    AttrValue::U16(port.entity_id),
                ),
            ])?;
            self.transact(evtocd, MessageBody::CreateRequest { attrs })
                .await?;
            debug!(
                self.fsm.log(),
                "bridge created";
                "uni_id" => port.uni_id,
                "bridge_eid" => bridge_eid,
            );
        }
        Ok(())
    }
}
