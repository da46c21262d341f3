//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::*;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    task::JoinSet,
    time,
};

use super::{
    dialer::read_identity_announce,
    error::ConnectionManagerError,
    friendly::{looks_like_http, FriendlyPage},
};
use crate::{
    builder::RuntimeConfig,
    connection::{Connection, ConnectionDirection},
    dispatcher::Dispatcher,
    framing::FrameCodec,
    identity::TrustSet,
    message::{IdentityAnnounce, WireFrame, PROTOCOL_VERSION},
    polling::PollRoutes,
    registry::Registry,
    tls::TlsConfig,
};
use tether_shutdown::ShutdownSignal;

const LOG_TARGET: &str = "comms::connection_manager::listener";

/// Shared state every accepted socket needs.
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub tls: TlsConfig,
    pub trust: Arc<TrustSet>,
    pub registry: Arc<Registry>,
    pub routes: Arc<PollRoutes>,
    pub friendly: Arc<FriendlyPage>,
    pub config: RuntimeConfig,
    pub shutdown_signal: ShutdownSignal,
    /// Total sockets accepted over the listener's lifetime.
    pub accepted: Arc<AtomicUsize>,
}

pub(crate) struct Listener {
    context: ListenerContext,
}

impl Listener {
    pub fn new(context: ListenerContext) -> Self {
        Self { context }
    }

    /// Accept loop. Each accepted socket is processed on its own task; the
    /// semaphore applies backpressure once too many sockets are mid-upgrade.
    pub async fn run(self, listener: TcpListener) {
        let local_addr = listener.local_addr().ok();
        info!(
            target: LOG_TARGET,
            "listening for fleet connections on {:?}", local_addr
        );
        let semaphore = Arc::new(Semaphore::new(self.context.config.max_concurrent_inbound));
        let mut sessions = JoinSet::new();
        let mut signal = self.context.shutdown_signal.clone();

        loop {
            tokio::select! {
                biased;
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        self.context.accepted.fetch_add(1, Ordering::Relaxed);
                        let permit = semaphore
                            .clone()
                            .acquire_owned()
                            .await
                            .expect("listener semaphore closed");
                        let context = self.context.clone();
                        sessions.spawn(async move {
                            let _permit = permit;
                            if let Err(err) = handle_socket(context, socket).await {
                                debug!(
                                    target: LOG_TARGET,
                                    "inbound connection from {} ended: {}", peer_addr, err
                                );
                            }
                        });
                    },
                    Err(err) => {
                        warn!(target: LOG_TARGET, "failed to accept a connection: {}", err);
                    },
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {},
            }
        }

        // Let in-flight sessions finish within the grace period, then cut them
        let deadline = time::sleep(self.context.config.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    let outstanding = sessions.len();
                    if outstanding > 0 {
                        warn!(
                            target: LOG_TARGET,
                            "aborting {} session(s) still running after the shutdown grace period",
                            outstanding
                        );
                    }
                    sessions.abort_all();
                    break;
                },
                next = sessions.join_next() => {
                    if next.is_none() {
                        break;
                    }
                },
            }
        }
        info!(
            target: LOG_TARGET,
            "listener on {:?} shut down", local_addr
        );
    }
}

/// Process one accepted socket end to end: wire-mode sniff, TLS upgrade,
/// trust check, identity exchange and the final handoff.
async fn handle_socket(context: ListenerContext, socket: TcpStream) -> Result<(), ConnectionManagerError> {
    // Plaintext HTTP gets a fast close so misconfigured clients fail
    // immediately instead of waiting out a TLS handshake that cannot succeed.
    let mut lead = [0u8; 4];
    if let Ok(Ok(peeked)) = time::timeout(context.config.plaintext_peek_deadline, socket.peek(&mut lead)).await {
        if looks_like_http(&lead[..peeked]) {
            debug!(
                target: LOG_TARGET,
                "closing plaintext HTTP connection on the TLS port"
            );
            return Err(ConnectionManagerError::PlaintextHttp);
        }
    }

    let (thumbprint, mut stream) = time::timeout(
        context.config.handshake_deadline,
        context.tls.upgrade_inbound(socket),
    )
    .await
    .map_err(|_| ConnectionManagerError::HandshakeTimedOut(context.config.handshake_deadline))??;

    // The first bytes over TLS decide between HTTP (friendly page) and the
    // framing protocol.
    let mut tls_lead = [0u8; 4];
    time::timeout(context.config.handshake_deadline, stream.read_exact(&mut tls_lead))
        .await
        .map_err(|_| ConnectionManagerError::HandshakeTimedOut(context.config.handshake_deadline))??;

    if looks_like_http(&tls_lead) {
        context.friendly.respond(stream, &tls_lead).await?;
        return Ok(());
    }

    if !context.trust.is_trusted(&thumbprint) {
        warn!(
            target: LOG_TARGET,
            "closing inbound connection: peer '{}' is not trusted", thumbprint
        );
        return Err(ConnectionManagerError::UntrustedPeer(thumbprint));
    }

    let mut framed = FrameCodec::with_preread(stream, &tls_lead);
    let announce = time::timeout(
        context.config.handshake_deadline,
        read_identity_announce(&mut framed),
    )
    .await
    .map_err(|_| ConnectionManagerError::HandshakeTimedOut(context.config.handshake_deadline))??;

    if announce.protocol_version != PROTOCOL_VERSION {
        return Err(ConnectionManagerError::UnsupportedProtocolVersion(
            announce.protocol_version,
        ));
    }

    framed
        .write_frame(&WireFrame::IdentityAnnounce(IdentityAnnounce {
            protocol_version: PROTOCOL_VERSION,
            subscription_id: None,
        }))
        .await?;

    let subscription_id = announce.subscription_id.clone();
    let conn = Connection::new(
        framed,
        ConnectionDirection::Inbound,
        thumbprint,
        subscription_id.clone(),
    );

    match subscription_id {
        Some(subscription_id) => {
            // Polling inversion: the dialed-in socket belongs to the local
            // caller side and services the subscription's queued requests.
            debug!(
                target: LOG_TARGET,
                "peer '{}' dialed in for subscription '{}'", thumbprint, subscription_id
            );
            context.routes.attach_connection(&subscription_id, conn).await;
        },
        None => {
            Dispatcher::new(context.registry.clone(), context.shutdown_signal.clone())
                .serve(conn)
                .await;
        },
    }
    Ok(())
}
