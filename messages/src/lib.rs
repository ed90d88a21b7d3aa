// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Message formats for the OMCI-style management conversation with an ONU.
//!
//! This crate is the trusted codec boundary of the adapter: it defines the
//! frame model exchanged with the remote device, the managed-entity classes
//! and attributes the control plane touches, and the fixed-size envelope
//! used to carry a frame through the inter-adapter transport.

pub mod me;
pub mod message;

use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The maximum size of one encoded message envelope.
pub const MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, Deserialize, Error, PartialEq, Serialize, SerializedSize)]
pub enum Error {
    /// An encoded envelope could not be serialized into the provided buffer.
    #[error("message serialization failed")]
    Serialization,

    /// An inbound envelope could not be decoded as a message.
    #[error("message deserialization failed")]
    Deserialization,

    /// The version in an inbound envelope header is unsupported.
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),

    /// An attribute list has no room for another entry.
    #[error("attribute list full")]
    TooManyAttributes,
}

impl From<hubpack::Error> for Error {
    fn from(_: hubpack::Error) -> Self {
        // hubpack reports one opaque failure kind for both directions. The
        // encode wrapper maps its own failures to `Serialization`; everything
        // reaching this conversion is a decode failure.
        Error::Deserialization
    }
}
