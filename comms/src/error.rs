//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use crate::{
    connection_manager::ConnectionManagerError,
    framing::FramingError,
    identity::Thumbprint,
    message::{ErrorDescriptor, MessageError, RemoteErrorKind},
    tls::TlsError,
};

/// The error kinds surfaced to callers of the runtime.
///
/// Transport-level errors destroy the affected connection; `ServiceInvocation`
/// carries the remote message verbatim and leaves the connection usable.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer '{0}' is not trusted")]
    UntrustedPeer(Thumbprint),
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("connection closed before the call completed")]
    ConnectionClosed,
    #[error("the request deadline was exceeded")]
    Timeout,
    #[error("no handler registered for {0}")]
    ServiceNotFound(String),
    #[error("{0}")]
    AmbiguousMethod(String),
    #[error("remote service error: {message}")]
    ServiceInvocation {
        message: String,
        detail: Option<String>,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("poll queue for subscription '{0}' is full")]
    QueueFull(String),
    #[error("the runtime is shutting down")]
    Shutdown,
}

impl RpcError {
    /// Convert an error descriptor received from the remote peer back into the
    /// local error kind, preserving the remote message verbatim.
    pub(crate) fn from_descriptor(descriptor: ErrorDescriptor) -> Self {
        match descriptor.kind {
            RemoteErrorKind::ServiceNotFound => RpcError::ServiceNotFound(descriptor.message),
            RemoteErrorKind::AmbiguousMethod => RpcError::AmbiguousMethod(descriptor.message),
            RemoteErrorKind::ServiceInvocation => RpcError::ServiceInvocation {
                message: descriptor.message,
                detail: descriptor.detail,
            },
            RemoteErrorKind::ProtocolViolation => RpcError::ProtocolViolation(descriptor.message),
            RemoteErrorKind::Shutdown => RpcError::Shutdown,
        }
    }
}

impl From<FramingError> for RpcError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::ConnectionClosed => RpcError::ConnectionClosed,
            FramingError::Io(_) => RpcError::ConnectionClosed,
            other => RpcError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<MessageError> for RpcError {
    fn from(err: MessageError) -> Self {
        RpcError::ProtocolViolation(err.to_string())
    }
}

impl From<TlsError> for RpcError {
    fn from(err: TlsError) -> Self {
        RpcError::HandshakeFailed(err.to_string())
    }
}

impl From<ConnectionManagerError> for RpcError {
    fn from(err: ConnectionManagerError) -> Self {
        match err {
            ConnectionManagerError::UntrustedPeer(tp) => RpcError::UntrustedPeer(tp),
            ConnectionManagerError::ThumbprintMismatch { observed, .. } => RpcError::UntrustedPeer(observed),
            ConnectionManagerError::HandshakeTimedOut(deadline) => {
                RpcError::HandshakeFailed(format!("handshake did not complete within {:.0?}", deadline))
            },
            ConnectionManagerError::Tls(err) => err.into(),
            ConnectionManagerError::Framing(err) => err.into(),
            ConnectionManagerError::Io(err) => RpcError::HandshakeFailed(err.to_string()),
            other => RpcError::ProtocolViolation(other.to_string()),
        }
    }
}
