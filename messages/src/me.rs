// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Managed-entity identities and attribute values.
//!
//! Only the classes and attributes the control plane actually reads or
//! writes appear here; this is not a full G.988 catalogue.

use crate::Error;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// A managed-entity class identifier.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
    SerializedSize,
)]
pub struct ClassId(pub u16);

impl ClassId {
    pub const ONU_G: ClassId = ClassId(256);
    pub const ONU2_G: ClassId = ClassId(257);
    pub const ONU_DATA: ClassId = ClassId(2);
    pub const GAL_ETHERNET_PROFILE: ClassId = ClassId(272);
    pub const MAC_BRIDGE_SERVICE_PROFILE: ClassId = ClassId(45);
    pub const MAC_BRIDGE_PORT_CONFIG_DATA: ClassId = ClassId(47);
    pub const EXTENDED_VLAN_TAGGING_OPERATION_CONFIG_DATA: ClassId = ClassId(171);
    pub const VLAN_TAGGING_FILTER_DATA: ClassId = ClassId(84);
    pub const IEEE_8021P_MAPPER_SERVICE_PROFILE: ClassId = ClassId(130);
    pub const T_CONT: ClassId = ClassId(262);
    pub const GEM_PORT_NETWORK_CTP: ClassId = ClassId(268);
    pub const GEM_INTERWORKING_TP: ClassId = ClassId(266);
    pub const PRIORITY_QUEUE: ClassId = ClassId(277);
    pub const TRAFFIC_SCHEDULER: ClassId = ClassId(278);
    pub const UNI_G: ClassId = ClassId(264);
    pub const PPTP_ETHERNET_UNI: ClassId = ClassId(11);
    pub const VIRTUAL_ETHERNET_INTERFACE_POINT: ClassId = ClassId(329);
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ClassId::ONU_G => "OnuG",
            ClassId::ONU2_G => "Onu2G",
            ClassId::ONU_DATA => "OnuData",
            ClassId::GAL_ETHERNET_PROFILE => "GalEthernetProfile",
            ClassId::MAC_BRIDGE_SERVICE_PROFILE => "MacBridgeServiceProfile",
            ClassId::MAC_BRIDGE_PORT_CONFIG_DATA => "MacBridgePortConfigData",
            ClassId::EXTENDED_VLAN_TAGGING_OPERATION_CONFIG_DATA => "ExtendedVlanTaggingOperationConfigData",
            ClassId::VLAN_TAGGING_FILTER_DATA => "VlanTaggingFilterData",
            ClassId::IEEE_8021P_MAPPER_SERVICE_PROFILE => "Ieee8021pMapperServiceProfile",
            ClassId::T_CONT => "TCont",
            ClassId::GEM_PORT_NETWORK_CTP => "GemPortNetworkCtp",
            ClassId::GEM_INTERWORKING_TP => "GemInterworkingTp",
            ClassId::PRIORITY_QUEUE => "PriorityQueue",
            ClassId::TRAFFIC_SCHEDULER => "TrafficScheduler",
            ClassId::UNI_G => "UniG",
            ClassId::PPTP_ETHERNET_UNI => "PptpEthernetUni",
            ClassId::VIRTUAL_ETHERNET_INTERFACE_POINT => "VirtualEthernetInterfacePoint",
            ClassId(other) => return write!(f, "Class({other})"),
        };
        f.write_str(name)
    }
}

/// A reference to one managed-entity instance on the remote device.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
    SerializedSize,
)]
pub struct MeRef {
    pub class: ClassId,
    pub instance: u16,
}

impl MeRef {
    pub const fn new(class: ClassId, instance: u16) -> Self {
        Self { class, instance }
    }
}

impl fmt::Display for MeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:#06x}", self.class, self.instance)
    }
}

/// The attributes the control plane reads or writes.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
    SerializedSize,
)]
pub enum Attribute {
    AdministrativeState,
    CurrentConnectivityMode,
    AllocId,
    RelatedPort,
    MaxGemPayloadSize,
    BridgeIdPointer,
    PortNum,
    TpType,
    TpPointer,
    PortId,
    TContPointer,
    Direction,
    TrafficManagementPointerUpstream,
    PriorityQueuePointerDownstream,
    GemPortCtpConnectivityPointer,
    InterworkingOption,
    ServiceProfilePointer,
    InterworkingTpPointer,
    GalProfilePointer,
    TrafficSchedulerPointer,
    Weight,
    AssociationType,
    AssociatedMePointer,
    InputTpid,
    OutputTpid,
    DownstreamMode,
    ReceivedFrameVlanTaggingOperationTable,
    VlanFilterList,
    ForwardOperation,
    NumberOfEntries,
    /// One slot of the 802.1p mapper's per-priority interwork pointer table.
    InterworkTpPointerForPBitPriority(u8),
}

/// A single attribute value.
///
/// Values are kept in their decoded, typed form; the byte-level attribute
/// layouts of G.988 never cross this boundary.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub enum AttrValue {
    U8(u8),
    U16(u16),
    U32(u32),
    /// A VLAN TCI filter table (VLAN tagging filter data).
    VidList([u16; 12]),
    /// One received-frame VLAN tagging treatment rule (extended VLAN
    /// tagging operation configuration data).
    TagRule([u8; 16]),
}

impl AttrValue {
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            AttrValue::U8(v) => Some(u16::from(*v)),
            AttrValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            AttrValue::U8(v) => Some(u32::from(*v)),
            AttrValue::U16(v) => Some(u32::from(*v)),
            AttrValue::U32(v) => Some(*v),
            _ => None,
        }
    }
}

/// One (attribute, value) pair in a request or response.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct AttributeEntry {
    pub attr: Attribute,
    pub value: AttrValue,
}

/// The maximum number of attributes in a single message.
pub const MAX_ATTRIBUTES: usize = 16;

/// A fixed-capacity list of attribute values.
///
/// Fixed capacity keeps the encoded envelope a bounded size; no message in
/// the management conversation carries more than [`MAX_ATTRIBUTES`] entries.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct AttributeList {
    entries: [Option<AttributeEntry>; MAX_ATTRIBUTES],
}

impl AttributeList {
    pub const fn empty() -> Self {
        Self {
            entries: [None; MAX_ATTRIBUTES],
        }
    }

    /// Build a list from a slice of pairs, failing if it does not fit.
    pub fn from_pairs(pairs: &[(Attribute, AttrValue)]) -> Result<Self, Error> {
        let mut out = Self::empty();
        for (attr, value) in pairs {
            out.push(*attr, *value)?;
        }
        Ok(out)
    }

    /// Append an entry, failing if the list is full.
    pub fn push(&mut self, attr: Attribute, value: AttrValue) -> Result<(), Error> {
        match self.entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(AttributeEntry { attr, value });
                Ok(())
            }
            None => Err(Error::TooManyAttributes),
        }
    }

    /// Return the value for `attr`, if present.
    pub fn get(&self, attr: Attribute) -> Option<AttrValue> {
        self.iter().find(|e| e.attr == attr).map(|e| e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeEntry> + '_ {
        self.entries.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}
