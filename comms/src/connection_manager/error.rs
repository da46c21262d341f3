//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use crate::{framing::FramingError, identity::Thumbprint, tls::TlsError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("peer '{0}' is not trusted")]
    UntrustedPeer(Thumbprint),
    #[error("peer '{observed}' does not match the expected thumbprint '{expected}'")]
    ThumbprintMismatch {
        expected: Thumbprint,
        observed: Thumbprint,
    },
    #[error("handshake did not complete within {0:.0?}")]
    HandshakeTimedOut(Duration),
    #[error("peer announced unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u32),
    #[error("expected an identity announce frame, got {0}")]
    UnexpectedFrame(&'static str),
    #[error("plaintext HTTP received on a TLS listener")]
    PlaintextHttp,
}
