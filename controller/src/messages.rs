// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Payload types carried on the control plane's internal channels.

use crate::tech_profile::PonAniConfig;
use omci_messages::message::Message;

/// One item on a configuration state machine's inbound queue.
#[derive(Clone, Debug)]
pub enum FsmMessage {
    /// A correlated protocol response, delivered by the management channel.
    Response(Message),
    /// Resume a machine parked on an external dependency.
    Proceed,
    /// Stop the message pump; the machine is expected to be driven to its
    /// disabled state next.
    Abort,
}

/// Operational state reported in an ONU indication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndicatedState {
    Up,
    Down,
    Unreachable,
}

/// An ONU indication relayed by the parent OLT adapter.
#[derive(Clone, Debug)]
pub struct OnuIndication {
    pub intf_id: u32,
    pub onu_id: u32,
    pub oper_state: IndicatedState,
    pub serial_number: String,
}

/// An inbound inter-adapter request, already unwrapped from its envelope.
///
/// The OMCI passthrough still carries encoded frame bytes; decoding them
/// is the device handler's first step and its first failure class.
#[derive(Clone, Debug)]
pub enum InterAdapterRequest {
    /// An encoded management-protocol frame from the remote device.
    OmciFrame(Vec<u8>),
    /// An ONU state indication.
    OnuIndication(OnuIndication),
    /// Provision (or re-provision) one UNI's technology profile.
    TechProfileDownload {
        uni_id: u8,
        path: String,
        config: PonAniConfig,
    },
    /// Tear down one GEM port of a previously downloaded profile.
    DeleteGemPort {
        uni_id: u8,
        tp_path: String,
        gem_port_id: u16,
    },
    /// Tear down the T-CONT of a previously downloaded profile.
    DeleteTcont {
        uni_id: u8,
        tp_path: String,
        alloc_id: u16,
    },
}
