// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! User-facing ports of the ONU.

use crate::proxy::OperState;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;

/// The managed-entity flavor backing a UNI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UniKind {
    Unknown,
    /// A physical Ethernet port (PPTP Ethernet UNI).
    Pptp,
    /// A virtual Ethernet interface point.
    Veip,
}

impl UniKind {
    /// The class addressed when setting this port's administrative state.
    pub fn class(&self) -> Option<ClassId> {
        match self {
            UniKind::Pptp => Some(ClassId::PPTP_ETHERNET_UNI),
            UniKind::Veip => Some(ClassId::VIRTUAL_ETHERNET_INTERFACE_POINT),
            UniKind::Unknown => None,
        }
    }
}

/// One user-facing port.
#[derive(Clone, Debug)]
pub struct OnuUniPort {
    /// Local index of the port on the device, starting at 0.
    pub uni_id: u8,
    /// Synthetic port number registered with the object model.
    pub port_no: u32,
    /// Entity id of the backing managed-entity instance.
    pub entity_id: u16,
    /// Bridge port number used when building bridge-related requests.
    /// Bridge ports count from 1.
    pub mac_bp_no: u8,
    pub kind: UniKind,
    pub name: String,
    pub enabled: bool,
    pub oper: OperState,
}

impl OnuUniPort {
    pub fn new(uni_id: u8, port_no: u32, entity_id: u16, kind: UniKind) -> Self {
        Self {
            uni_id,
            port_no,
            entity_id,
            mac_bp_no: uni_id + 1,
            kind,
            name: format!("uni-{port_no}"),
            enabled: true,
            oper: OperState::Unknown,
        }
    }

    /// The managed-entity instance this port's admin state lives on.
    pub fn admin_me(&self) -> Option<MeRef> {
        self.kind.class().map(|class| MeRef::new(class, self.entity_id))
    }
}

/// Derive the synthetic port number of a UNI from its position in the
/// access tree: 12 bits of PON interface, 7 bits of ONU id, 4 bits of
/// local UNI index.
pub fn mk_uni_port_num(intf_id: u32, onu_id: u32, uni_id: u8) -> u32 {
    (intf_id << 11) | (onu_id << 4) | u32::from(uni_id)
}
