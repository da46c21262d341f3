//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use log::*;
use tokio::{net::TcpStream, time};

use super::error::ConnectionManagerError;
use crate::{
    connection::{Connection, ConnectionDirection},
    framing::{FrameCodec, FramingError},
    identity::{Thumbprint, TrustSet},
    message::{IdentityAnnounce, WireFrame, PROTOCOL_VERSION},
    tls::TlsConfig,
};

const LOG_TARGET: &str = "comms::connection_manager::dialer";

/// Establishes outbound connections: TCP, TLS with mutual authentication,
/// trust pinning and the identity sub-handshake.
#[derive(Clone)]
pub struct Dialer {
    tls: TlsConfig,
    trust: Arc<TrustSet>,
    handshake_deadline: Duration,
}

impl Dialer {
    pub(crate) fn new(tls: TlsConfig, trust: Arc<TrustSet>, handshake_deadline: Duration) -> Self {
        Self {
            tls,
            trust,
            handshake_deadline,
        }
    }

    /// Dial a listening peer. `subscription_id` is announced for polling
    /// connections and left out for plain caller connections.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        expected_peer: Thumbprint,
        subscription_id: Option<String>,
    ) -> Result<Connection, ConnectionManagerError> {
        debug!(
            target: LOG_TARGET,
            "dialing {}:{} (subscription: {:?})", host, port, subscription_id
        );
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;

        let (thumbprint, stream) = time::timeout(
            self.handshake_deadline,
            self.tls.upgrade_outbound(socket, host),
        )
        .await
        .map_err(|_| ConnectionManagerError::HandshakeTimedOut(self.handshake_deadline))??;

        if !self.trust.is_trusted(&thumbprint) {
            warn!(
                target: LOG_TARGET,
                "refusing connection to {}:{}: peer '{}' is not trusted", host, port, thumbprint
            );
            return Err(ConnectionManagerError::UntrustedPeer(thumbprint));
        }
        if thumbprint != expected_peer {
            warn!(
                target: LOG_TARGET,
                "refusing connection to {}:{}: peer '{}' does not match expected '{}'",
                host,
                port,
                thumbprint,
                expected_peer
            );
            return Err(ConnectionManagerError::ThumbprintMismatch {
                expected: expected_peer,
                observed: thumbprint,
            });
        }

        let mut framed = FrameCodec::new(stream);
        framed
            .write_frame(&WireFrame::IdentityAnnounce(IdentityAnnounce {
                protocol_version: PROTOCOL_VERSION,
                subscription_id: subscription_id.clone(),
            }))
            .await?;

        let reply = time::timeout(self.handshake_deadline, read_identity_announce(&mut framed))
            .await
            .map_err(|_| ConnectionManagerError::HandshakeTimedOut(self.handshake_deadline))??;
        if reply.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionManagerError::UnsupportedProtocolVersion(
                reply.protocol_version,
            ));
        }

        debug!(
            target: LOG_TARGET,
            "connected to peer '{}' at {}:{}", thumbprint, host, port
        );
        Ok(Connection::new(
            framed,
            ConnectionDirection::Outbound,
            thumbprint,
            subscription_id,
        ))
    }
}

pub(super) async fn read_identity_announce<S>(
    framed: &mut FrameCodec<S>,
) -> Result<IdentityAnnounce, ConnectionManagerError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match framed.read_frame().await {
        Ok(WireFrame::IdentityAnnounce(announce)) => Ok(announce),
        Ok(other) => Err(ConnectionManagerError::UnexpectedFrame(other.variant_name())),
        Err(FramingError::ConnectionClosed) => Err(FramingError::ConnectionClosed.into()),
        Err(err) => Err(err.into()),
    }
}
