// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The locally mirrored managed-entity database of one ONU.
//!
//! After MIB synchronization, the adapter holds a mirror of the remote
//! device's managed entities. Everything downstream of synchronization
//! (UNI discovery, T-CONT selection, priority-queue resolution) is a
//! query against this mirror rather than another round trip to the
//! device.

mod database;
pub mod queues;

pub use database::AttributeMap;
pub use database::MibDatabase;

use omci_messages::me::Attribute;
use omci_messages::me::MeRef;
use thiserror::Error;

/// An error related to querying the mirrored database.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum Error {
    #[error("no instance of {0} in the mirrored database")]
    NoInstance(MeRef),

    #[error("{0} has no attribute {1:?}")]
    MissingAttribute(MeRef, Attribute),

    #[error("{0} attribute {1:?} has an unexpected value type")]
    WrongValueType(MeRef, Attribute),
}
