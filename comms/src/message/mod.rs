//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Wire messages.
//!
//! Every structured frame on the wire is one of [`WireFrame`]'s variants,
//! encoded as an externally tagged MessagePack object: a self-describing
//! tagged union over maps, sequences and primitives. Stream attachments are
//! not part of the structured payload; frames only declare their ids and the
//! raw bytes follow out-of-band (see [`crate::framing`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The single protocol version token this runtime speaks.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    IdentityAnnounce(IdentityAnnounce),
    Request(RequestFrame),
    Response(ResponseFrame),
}

impl WireFrame {
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            WireFrame::IdentityAnnounce(_) => "IdentityAnnounce",
            WireFrame::Request(_) => "Request",
            WireFrame::Response(_) => "Response",
        }
    }
}

/// Exchanged immediately after the TLS handshake. A polling connection
/// declares the subscription it is servicing; listening-orientation
/// connections leave it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAnnounce {
    pub protocol_version: u32,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: u64,
    pub service: String,
    pub method: String,
    pub args: Vec<RpcValue>,
    /// Ids of the stream attachments that follow this frame, in wire order.
    pub stream_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub result: Result<RpcValue, ErrorDescriptor>,
    pub stream_ids: Vec<u64>,
}

/// A remote failure carried in a response. `message` is preserved verbatim;
/// `detail` carries remote stack or diagnostic text when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    ServiceNotFound,
    AmbiguousMethod,
    ServiceInvocation,
    ProtocolViolation,
    Shutdown,
}

/// An argument or result payload: primitives, small aggregates and references
/// to attached streams by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    /// Arbitrary-precision decimal carried as its canonical string form.
    Decimal(String),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
    /// Reference to a stream attachment by id.
    Stream(u64),
}

/// The declared-type shape of a value, used for overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Null,
    Bool,
    Int,
    Double,
    Decimal,
    Str,
    Bytes,
    List,
    Map,
    Stream,
}

impl RpcValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            RpcValue::Null => ValueShape::Null,
            RpcValue::Bool(_) => ValueShape::Bool,
            RpcValue::Int(_) => ValueShape::Int,
            RpcValue::Double(_) => ValueShape::Double,
            RpcValue::Decimal(_) => ValueShape::Decimal,
            RpcValue::Str(_) => ValueShape::Str,
            RpcValue::Bytes(_) => ValueShape::Bytes,
            RpcValue::List(_) => ValueShape::List,
            RpcValue::Map(_) => ValueShape::Map,
            RpcValue::Stream(_) => ValueShape::Stream,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_stream_id(&self) -> Option<u64> {
        match self {
            RpcValue::Stream(id) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_request() -> WireFrame {
        let mut map = BTreeMap::new();
        map.insert("retries".to_string(), RpcValue::Int(3));
        map.insert("verbose".to_string(), RpcValue::Bool(true));
        WireFrame::Request(RequestFrame {
            request_id: 42,
            service: "telemetry".to_string(),
            method: "upload".to_string(),
            args: vec![
                RpcValue::Str("batch-7".to_string()),
                RpcValue::Double(0.25),
                RpcValue::Decimal("11.50".to_string()),
                RpcValue::Bytes(vec![0, 159, 146, 150]),
                RpcValue::List(vec![RpcValue::Null, RpcValue::Int(-1)]),
                RpcValue::Map(map),
                RpcValue::Stream(1),
            ],
            stream_ids: vec![1],
        })
    }

    #[test]
    fn request_round_trip() {
        let frame = sample_request();
        let bytes = frame.to_wire_bytes().unwrap();
        let decoded = WireFrame::from_wire_bytes(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn response_round_trip_ok_and_err() {
        let ok = WireFrame::Response(ResponseFrame {
            request_id: 7,
            result: Ok(RpcValue::Int(1_048_591)),
            stream_ids: vec![],
        });
        let err = WireFrame::Response(ResponseFrame {
            request_id: 8,
            result: Err(ErrorDescriptor {
                kind: RemoteErrorKind::ServiceInvocation,
                message: "disk full".to_string(),
                detail: Some("at upload_batch (worker.rs:40)".to_string()),
            }),
            stream_ids: vec![9, 10],
        });
        for frame in [ok, err] {
            let decoded = WireFrame::from_wire_bytes(&frame.to_wire_bytes().unwrap()).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn identity_announce_round_trip() {
        for subscription_id in [None, Some("agent-1".to_string())] {
            let frame = WireFrame::IdentityAnnounce(IdentityAnnounce {
                protocol_version: PROTOCOL_VERSION,
                subscription_id,
            });
            let decoded = WireFrame::from_wire_bytes(&frame.to_wire_bytes().unwrap()).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(WireFrame::from_wire_bytes(&[0xc1, 0xff, 0x00]).is_err());
        assert!(WireFrame::from_wire_bytes(b"").is_err());
    }

    #[test]
    fn shapes() {
        assert_eq!(RpcValue::Int(1).shape(), ValueShape::Int);
        assert_eq!(RpcValue::Double(1.0).shape(), ValueShape::Double);
        assert_eq!(RpcValue::Decimal("1".into()).shape(), ValueShape::Decimal);
        assert_eq!(RpcValue::Stream(3).shape(), ValueShape::Stream);
    }
}
