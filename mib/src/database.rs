// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

use crate::Error;
use omci_messages::me::AttrValue;
use omci_messages::me::Attribute;
use omci_messages::me::AttributeList;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;
use std::collections::BTreeMap;

/// The decoded attributes of one managed-entity instance.
pub type AttributeMap = BTreeMap<Attribute, AttrValue>;

/// The mirrored managed-entity database.
///
/// Instances are keyed by (class, instance id); iteration over the
/// instances of a class is always in ascending instance-id order.
#[derive(Clone, Debug, Default)]
pub struct MibDatabase {
    entities: BTreeMap<ClassId, BTreeMap<u16, AttributeMap>>,
}

impl MibDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the entire mirror, e.g. ahead of a fresh MIB upload.
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Record an instance, merging `attrs` over any attributes already
    /// known for it.
    pub fn put(&mut self, me: MeRef, attrs: &AttributeList) {
        let map = self
            .entities
            .entry(me.class)
            .or_default()
            .entry(me.instance)
            .or_default();
        for entry in attrs.iter() {
            map.insert(entry.attr, entry.value);
        }
    }

    pub fn contains(&self, me: MeRef) -> bool {
        self.entities
            .get(&me.class)
            .is_some_and(|m| m.contains_key(&me.instance))
    }

    /// The instance ids of `class`, in ascending order.
    pub fn instances(&self, class: ClassId) -> Vec<u16> {
        self.entities
            .get(&class)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The lowest-numbered instance of `class`, if any exists.
    pub fn first_instance(&self, class: ClassId) -> Option<u16> {
        self.entities
            .get(&class)
            .and_then(|m| m.keys().next().copied())
    }

    /// The value of one attribute of one instance.
    pub fn attr(&self, me: MeRef, attr: Attribute) -> Result<AttrValue, Error> {
        let map = self
            .entities
            .get(&me.class)
            .and_then(|m| m.get(&me.instance))
            .ok_or(Error::NoInstance(me))?;
        map.get(&attr)
            .copied()
            .ok_or(Error::MissingAttribute(me, attr))
    }

    /// The value of one attribute, widened to `u32`.
    pub fn attr_u32(&self, me: MeRef, attr: Attribute) -> Result<u32, Error> {
        self.attr(me, attr)?
            .as_u32()
            .ok_or(Error::WrongValueType(me, attr))
    }

    /// Total number of mirrored instances, across all classes.
    pub fn len(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
