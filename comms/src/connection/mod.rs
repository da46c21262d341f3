//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! A secured, identity-announced connection to a peer.
//!
//! Connections are owned by exactly one task at a time: the pool owns Idle
//! entries, `checkout` transfers ownership to a caller, and anything Broken is
//! destroyed rather than returned. The protocol on a connection is strictly
//! alternating request/response; there is no multiplexing.

pub mod pool;

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use log::*;
use tokio::sync::mpsc;

use crate::{
    error::RpcError,
    framing::{FrameCodec, FramingError, InboundStream, OutboundStream},
    identity::Thumbprint,
    message::{RequestFrame, ResponseFrame, RpcValue, WireFrame},
    tls::SecureStream,
};

const LOG_TARGET: &str = "comms::connection";

/// Capacity of the per-attachment chunk channel between the connection task
/// and a handler. Backpressure, not buffering: the socket is only read as
/// fast as the handler consumes.
const ATTACHMENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionDirection::Inbound => write!(f, "inbound"),
            ConnectionDirection::Outbound => write!(f, "outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Idle,
    Busy,
    /// Terminal. A broken connection is destroyed, never reused.
    Broken,
}

/// The outcome of a successful call: the result value plus any
/// response-direction stream payloads, in declared order.
#[derive(Debug)]
pub struct CallReply {
    pub value: RpcValue,
    pub streams: Vec<InboundPayload>,
}

/// A fully received response-direction attachment.
#[derive(Debug)]
pub struct InboundPayload {
    pub id: u64,
    pub data: Bytes,
}

pub struct Connection {
    framed: FrameCodec<SecureStream>,
    direction: ConnectionDirection,
    peer_thumbprint: Thumbprint,
    subscription_id: Option<String>,
    state: ConnectionState,
    last_used_at: Instant,
    next_request_id: u64,
}

impl Connection {
    pub(crate) fn new(
        framed: FrameCodec<SecureStream>,
        direction: ConnectionDirection,
        peer_thumbprint: Thumbprint,
        subscription_id: Option<String>,
    ) -> Self {
        Self {
            framed,
            direction,
            peer_thumbprint,
            subscription_id,
            state: ConnectionState::Idle,
            last_used_at: Instant::now(),
            next_request_id: 0,
        }
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn peer_thumbprint(&self) -> Thumbprint {
        self.peer_thumbprint
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }

    pub(crate) fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    /// Record release time. Idle age is measured from the last release, not
    /// the last checkout.
    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub(crate) fn idle_age(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Best-effort liveness probe for pooled connections: peeks the TCP
    /// stream without consuming TLS records. EOF or unsolicited bytes on an
    /// idle connection both mean it cannot be reused.
    pub(crate) fn is_disconnected(&self) -> bool {
        let (tcp, _) = self.framed.get_ref().get_ref();
        let mut buf = [0u8; 1];
        match tcp.peek(&mut buf).now_or_never() {
            Some(Ok(0)) => true,
            Some(Ok(_)) => true,
            Some(Err(_)) => true,
            None => false,
        }
    }

    fn next_request_id(&mut self) -> u64 {
        // Zero is reserved so an all-defaults frame is never valid
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Caller-side exchange: write one request (with attachments), read the
    /// matching response (with attachments). Transport or protocol faults
    /// mark the connection Broken; remote service errors leave it Idle.
    pub(crate) async fn exchange(
        &mut self,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
        streams: Vec<OutboundStream>,
    ) -> Result<CallReply, RpcError> {
        self.state = ConnectionState::Busy;
        let request_id = self.next_request_id();
        let frame = WireFrame::Request(RequestFrame {
            request_id,
            service: service.to_string(),
            method: method.to_string(),
            args,
            stream_ids: streams.iter().map(OutboundStream::id).collect(),
        });

        let result = self.exchange_inner(request_id, frame, streams).await;
        match &result {
            Ok(_) => {
                self.state = ConnectionState::Idle;
            },
            Err(err) if err_poisons_connection(err) => {
                trace!(
                    target: LOG_TARGET,
                    "request #{} to peer '{}' broke the connection: {}",
                    request_id,
                    self.peer_thumbprint,
                    err
                );
                self.mark_broken();
            },
            Err(_) => {
                // Remote replied with a well-formed error; the connection is
                // still in a known state
                self.state = ConnectionState::Idle;
            },
        }
        result
    }

    async fn exchange_inner(
        &mut self,
        request_id: u64,
        frame: WireFrame,
        streams: Vec<OutboundStream>,
    ) -> Result<CallReply, RpcError> {
        self.framed.write_frame(&frame).await?;
        for mut stream in streams {
            self.framed.write_attachment(&mut stream).await?;
        }

        let response = self.read_response().await?;
        if response.request_id != request_id {
            return Err(RpcError::ProtocolViolation(format!(
                "response id {} does not match request id {}",
                response.request_id, request_id
            )));
        }

        let mut payloads = Vec::with_capacity(response.stream_ids.len());
        for id in &response.stream_ids {
            let length = match self.framed.begin_attachment().await? {
                Some(length) => length,
                None => {
                    return Err(RpcError::ProtocolViolation(
                        "response declared more attachments than were sent".to_string(),
                    ))
                },
            };
            let mut data = Vec::with_capacity(length.min(u32::MAX as u64) as usize);
            while let Some(chunk) = self.framed.attachment_chunk().await? {
                data.extend_from_slice(&chunk);
            }
            payloads.push(InboundPayload {
                id: *id,
                data: data.into(),
            });
        }

        match response.result {
            Ok(value) => Ok(CallReply {
                value,
                streams: payloads,
            }),
            Err(descriptor) => Err(RpcError::from_descriptor(descriptor)),
        }
    }

    async fn read_response(&mut self) -> Result<ResponseFrame, FramingError> {
        match self.framed.read_frame().await? {
            WireFrame::Response(response) => Ok(response),
            other => Err(FramingError::UnexpectedFrame {
                expected: "Response",
                got: other.variant_name(),
            }),
        }
    }

    /// Callee-side read of the next request.
    pub(crate) async fn read_request(&mut self) -> Result<RequestFrame, FramingError> {
        match self.framed.read_frame().await? {
            WireFrame::Request(request) => Ok(request),
            other => Err(FramingError::UnexpectedFrame {
                expected: "Request",
                got: other.variant_name(),
            }),
        }
    }

    /// Callee-side write of a response and its attachments.
    pub(crate) async fn write_response(
        &mut self,
        response: ResponseFrame,
        streams: Vec<OutboundStream>,
    ) -> Result<(), FramingError> {
        self.framed.write_frame(&WireFrame::Response(response)).await?;
        for mut stream in streams {
            self.framed.write_attachment(&mut stream).await?;
        }
        Ok(())
    }

    /// Build handler-side stream handles for the given declared attachment
    /// ids, paired with the senders the pump feeds.
    pub(crate) fn make_inbound_streams(stream_ids: &[u64]) -> (Vec<InboundStream>, Vec<mpsc::Sender<Bytes>>) {
        let mut handles = Vec::with_capacity(stream_ids.len());
        let mut senders = Vec::with_capacity(stream_ids.len());
        for id in stream_ids {
            let (tx, rx) = mpsc::channel(ATTACHMENT_CHANNEL_CAPACITY);
            handles.push(InboundStream::new(*id, rx));
            senders.push(tx);
        }
        (handles, senders)
    }

    /// Read every declared request attachment off the wire in order, feeding
    /// chunks to the paired handler channels. Chunks for a handle the handler
    /// dropped are discarded, so the wire always drains.
    pub(crate) async fn pump_attachments(
        &mut self,
        senders: Vec<mpsc::Sender<Bytes>>,
    ) -> Result<(), FramingError> {
        for sender in senders {
            if self.framed.begin_attachment().await?.is_none() {
                return Err(FramingError::UnreadAttachments(0));
            }
            let mut receiver_gone = false;
            while let Some(chunk) = self.framed.attachment_chunk().await? {
                if receiver_gone {
                    continue;
                }
                if sender.send(chunk).await.is_err() {
                    receiver_gone = true;
                }
            }
        }
        // `senders` was built from the declared ids, so nothing remains, but a
        // malformed flow is cheaper to drain than to renegotiate
        self.framed.drain_attachments().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("direction", &self.direction)
            .field("peer_thumbprint", &self.peer_thumbprint)
            .field("subscription_id", &self.subscription_id)
            .field("state", &self.state)
            .finish()
    }
}

fn err_poisons_connection(err: &RpcError) -> bool {
    !matches!(
        err,
        RpcError::ServiceInvocation { .. } |
            RpcError::ServiceNotFound(_) |
            RpcError::AmbiguousMethod(_) |
            RpcError::Shutdown
    )
}
