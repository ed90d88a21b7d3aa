// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Message formats and envelope encoding.

use crate::me::AttributeList;
use crate::me::MeRef;
use crate::Error;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

pub mod version {
    pub const V1: u8 = 1;
}

/// A common header to all messages exchanged with the remote device.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, SerializedSize)]
pub struct Header {
    /// The protocol version.
    pub version: u8,
    /// The transaction identifier, shared between a request and its
    /// response. Zero is reserved for unsolicited notifications and is
    /// never assigned to a request.
    pub tid: u16,
}

impl Header {
    pub const fn new(tid: u16) -> Self {
        Self {
            version: version::V1,
            tid,
        }
    }
}

/// One frame of the management conversation.
///
/// All messages address exactly one managed-entity instance; multi-entity
/// operations are expressed as sequences of single-entity exchanges.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, SerializedSize)]
pub struct Message {
    pub header: Header,
    /// The managed-entity instance this message addresses.
    pub me: MeRef,
    pub body: MessageBody,
}

impl Message {
    pub const fn new(tid: u16, me: MeRef, body: MessageBody) -> Self {
        Self {
            header: Header::new(tid),
            me,
            body,
        }
    }

    /// The kind of this message, for dispatch and diagnostics.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// True if this message is a response to an earlier request.
    pub fn is_response(&self) -> bool {
        self.kind().is_response()
    }
}

/// The body of a message.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, SerializedSize)]
pub enum MessageBody {
    CreateRequest { attrs: AttributeList },
    CreateResponse { result: ResultCode },
    SetRequest { attrs: AttributeList },
    SetResponse { result: ResultCode },
    GetRequest { mask: u16 },
    GetResponse { result: ResultCode, mask: u16, attrs: AttributeList },
    DeleteRequest,
    DeleteResponse { result: ResultCode },
    MibResetRequest,
    MibResetResponse { result: ResultCode },
    MibUploadRequest,
    MibUploadResponse { count: u16 },
    MibUploadNextRequest { seq: u16 },
    MibUploadNextResponse { reported: MeRef, attrs: AttributeList },
    RebootRequest,
    RebootResponse { result: ResultCode },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::CreateRequest { .. } => MessageKind::CreateRequest,
            MessageBody::CreateResponse { .. } => MessageKind::CreateResponse,
            MessageBody::SetRequest { .. } => MessageKind::SetRequest,
            MessageBody::SetResponse { .. } => MessageKind::SetResponse,
            MessageBody::GetRequest { .. } => MessageKind::GetRequest,
            MessageBody::GetResponse { .. } => MessageKind::GetResponse,
            MessageBody::DeleteRequest => MessageKind::DeleteRequest,
            MessageBody::DeleteResponse { .. } => MessageKind::DeleteResponse,
            MessageBody::MibResetRequest => MessageKind::MibResetRequest,
            MessageBody::MibResetResponse { .. } => MessageKind::MibResetResponse,
            MessageBody::MibUploadRequest => MessageKind::MibUploadRequest,
            MessageBody::MibUploadResponse { .. } => MessageKind::MibUploadResponse,
            MessageBody::MibUploadNextRequest { .. } => MessageKind::MibUploadNextRequest,
            MessageBody::MibUploadNextResponse { .. } => MessageKind::MibUploadNextResponse,
            MessageBody::RebootRequest => MessageKind::RebootRequest,
            MessageBody::RebootResponse { .. } => MessageKind::RebootResponse,
        }
    }

    /// The result code carried by a response body, if any.
    pub fn result(&self) -> Option<ResultCode> {
        match self {
            MessageBody::CreateResponse { result }
            | MessageBody::SetResponse { result }
            | MessageBody::GetResponse { result, .. }
            | MessageBody::DeleteResponse { result }
            | MessageBody::MibResetResponse { result }
            | MessageBody::RebootResponse { result } => Some(*result),
            _ => None,
        }
    }
}

/// Discriminant of a message body.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, SerializedSize)]
pub enum MessageKind {
    CreateRequest,
    CreateResponse,
    SetRequest,
    SetResponse,
    GetRequest,
    GetResponse,
    DeleteRequest,
    DeleteResponse,
    MibResetRequest,
    MibResetResponse,
    MibUploadRequest,
    MibUploadResponse,
    MibUploadNextRequest,
    MibUploadNextResponse,
    RebootRequest,
    RebootResponse,
}

impl MessageKind {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageKind::CreateResponse
                | MessageKind::SetResponse
                | MessageKind::GetResponse
                | MessageKind::DeleteResponse
                | MessageKind::MibResetResponse
                | MessageKind::MibUploadResponse
                | MessageKind::MibUploadNextResponse
                | MessageKind::RebootResponse
        )
    }
}

/// The outcome of a request, as reported by the remote device.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, SerializedSize)]
pub enum ResultCode {
    Success,
    ProcessingError,
    NotSupported,
    ParameterError,
    UnknownManagedEntity,
    UnknownInstance,
    DeviceBusy,
    InstanceExists,
    AttributeFailure,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// Encode a message into `buf`, returning the number of bytes written.
pub fn serialize(buf: &mut [u8], message: &Message) -> Result<usize, Error> {
    hubpack::serialize(buf, message).map_err(|_| Error::Serialization)
}

/// Decode a message from `buf`, returning it and any trailing bytes.
pub fn deserialize(buf: &[u8]) -> Result<(Message, &[u8]), Error> {
    let (message, rest): (Message, _) = hubpack::deserialize(buf)?;
    if message.header.version != version::V1 {
        return Err(Error::VersionMismatch(message.header.version));
    }
    Ok((message, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::me::AttrValue;
    use crate::me::Attribute;
    use crate::me::ClassId;
    use crate::MAX_MESSAGE_SIZE;

    #[test]
    fn test_envelope_round_trip() {
        let attrs = AttributeList::from_pairs(&[
            (Attribute::PortId, AttrValue::U16(1024)),
            (Attribute::Direction, AttrValue::U8(3)),
        ])
        .unwrap();
        let message = Message::new(
            17,
            MeRef::new(ClassId::GEM_PORT_NETWORK_CTP, 1024),
            MessageBody::CreateRequest { attrs },
        );
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = serialize(&mut buf, &message).unwrap();
        let (decoded, rest) = deserialize(&buf[..n]).unwrap();
        assert_eq!(decoded, message);
        assert!(rest.is_empty());
        assert_eq!(decoded.kind(), MessageKind::CreateRequest);
        assert!(!decoded.is_response());
    }

    #[test]
    fn test_envelope_version_mismatch() {
        let message = Message::new(
            1,
            MeRef::new(ClassId::ONU_G, 0),
            MessageBody::SetRequest {
                attrs: AttributeList::empty(),
            },
        );
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let n = serialize(&mut buf, &message).unwrap();
        // The version is the first byte of the header.
        buf[0] = 0xff;
        assert_eq!(deserialize(&buf[..n]), Err(Error::VersionMismatch(0xff)));
    }

    #[test]
    fn test_response_result_codes() {
        let ok = MessageBody::CreateResponse {
            result: ResultCode::Success,
        };
        assert!(ok.result().unwrap().is_success());
        assert!(ok.kind().is_response());

        let busy = MessageBody::SetResponse {
            result: ResultCode::DeviceBusy,
        };
        assert!(!busy.result().unwrap().is_success());

        let req = MessageBody::GetRequest { mask: 0xe000 };
        assert!(req.result().is_none());
    }
}
