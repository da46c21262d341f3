//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! # tether_comms
//!
//! A secure, bidirectional RPC runtime for fleet communication between a
//! central hub and many remote nodes. Participants are identified by X.509
//! certificate thumbprints pinned in a trust set; there is no chain
//! validation and no PKI.
//!
//! Two transport orientations share identical application semantics:
//!
//! - **Listening**: the participant binds a TCP port and accepts mutually
//!   authenticated TLS connections.
//! - **Polling**: the participant dials out to a listener, announces a
//!   subscription id and then services calls in the reverse direction over
//!   the dialed socket. A hub can invoke methods on nodes behind NAT without
//!   any inbound port on the node.
//!
//! Requests and responses are strictly alternating, length-delimited,
//! deflate-compressed MessagePack frames; bulk payloads travel as raw stream
//! attachments after the frame with per-percent progress reporting.

pub mod backoff;
mod builder;
mod client;
pub mod connection;
pub mod connection_manager;
mod dispatcher;
mod endpoint;
mod error;
pub mod framing;
pub mod identity;
pub mod message;
mod node;
mod polling;
pub mod registry;
pub mod tls;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod test;

pub use self::{
    builder::{BuildError, RuntimeConfig, TetherBuilder},
    client::Client,
    connection::{CallReply, InboundPayload},
    connection_manager::friendly::DEFAULT_FRIENDLY_PAGE,
    endpoint::{Endpoint, EndpointError, EndpointTarget},
    error::RpcError,
    framing::{InboundStream, OutboundStream, ProgressSink},
    identity::{NodeIdentity, Thumbprint, TrustSet},
    message::{RpcValue, ValueShape},
    node::TetherNode,
    registry::{InvocationError, ParamType, Registry, ServiceRequest, ServiceResponse},
};
