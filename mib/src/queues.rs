// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Priority-queue resolution.
//!
//! The device reports its priority queues with a "related port" attribute
//! encoding which T-CONT (upstream) or UNI (downstream) the queue serves,
//! together with the priority index within that port. ANI provisioning
//! resolves the queue instances to point GEM ports at by scanning the
//! mirrored database for a matching related port.

use crate::MibDatabase;
use omci_messages::me::Attribute;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;

/// Upstream queue instances have bit 15 of their entity id set; anything
/// below is a downstream queue.
const UPSTREAM_QUEUE_FLOOR: u16 = 0x8000;

/// The related-port attribute carries a slot number in its top byte, which
/// is meaningless for queue matching and masked off.
const RELATED_PORT_MASK: u32 = 0x00ff_ffff;

/// The upstream priority queue serving `(tcont, prio)`, if the device
/// reports one.
pub fn upstream_queue(db: &MibDatabase, tcont: u16, prio: u8) -> Option<u16> {
    let wanted = (u32::from(tcont) << 16) | u32::from(prio);
    db.instances(ClassId::PRIORITY_QUEUE)
        .into_iter()
        .filter(|&instance| instance >= UPSTREAM_QUEUE_FLOOR)
        .find(|&instance| related_port(db, instance) == Some(wanted))
}

/// The downstream priority queue serving `(uni_id, prio)`, if the device
/// reports one. Downstream related ports count UNIs from 1.
pub fn downstream_queue(db: &MibDatabase, uni_id: u8, prio: u8) -> Option<u16> {
    let wanted = (u32::from(uni_id) + 1) << 16 | u32::from(prio);
    db.instances(ClassId::PRIORITY_QUEUE)
        .into_iter()
        .filter(|&instance| instance < UPSTREAM_QUEUE_FLOOR)
        .find(|&instance| {
            related_port(db, instance).map(|port| port & RELATED_PORT_MASK) == Some(wanted)
        })
}

fn related_port(db: &MibDatabase, instance: u16) -> Option<u32> {
    db.attr_u32(
        MeRef::new(ClassId::PRIORITY_QUEUE, instance),
        Attribute::RelatedPort,
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use omci_messages::me::AttrValue;
    use omci_messages::me::AttributeList;

    fn queue(db: &mut MibDatabase, instance: u16, related_port: u32) {
        db.put(
            MeRef::new(ClassId::PRIORITY_QUEUE, instance),
            &AttributeList::from_pairs(&[(Attribute::RelatedPort, AttrValue::U32(related_port))])
                .unwrap(),
        );
    }

    #[test]
    fn test_upstream_queue_resolution() {
        let mut db = MibDatabase::new();
        queue(&mut db, 0x8001, 0x8001_0000);
        queue(&mut db, 0x8002, 0x8001_0001);
        // A downstream queue that would otherwise match.
        queue(&mut db, 0x0001, 0x8001_0001);

        assert_eq!(upstream_queue(&db, 0x8001, 0), Some(0x8001));
        assert_eq!(upstream_queue(&db, 0x8001, 1), Some(0x8002));
        assert_eq!(upstream_queue(&db, 0x8001, 2), None);
        assert_eq!(upstream_queue(&db, 0x8002, 0), None);
    }

    #[test]
    fn test_downstream_queue_ignores_slot_byte() {
        let mut db = MibDatabase::new();
        // Slot 1 in the top byte; UNI index 0 counts as port 1.
        queue(&mut db, 0x0001, 0x0101_0000);
        queue(&mut db, 0x0002, 0x0101_0001);
        // Upstream instance excluded despite a matching low 24 bits.
        queue(&mut db, 0x8003, 0x0001_0000);

        assert_eq!(downstream_queue(&db, 0, 0), Some(0x0001));
        assert_eq!(downstream_queue(&db, 0, 1), Some(0x0002));
        assert_eq!(downstream_queue(&db, 1, 0), None);
    }
}
