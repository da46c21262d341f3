//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! The runtime object.
//!
//! Owns the local identity, the trust set, the registry, the connection pool
//! and the poll routes. Listeners and pollers are spawned from here and all
//! observe the node's shutdown signal; dropping the node triggers it, so
//! sockets, tasks and pooled connections are released on every exit path.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::*;
use tokio::net::TcpListener;
use tether_shutdown::{Shutdown, ShutdownSignal};

use crate::{
    builder::RuntimeConfig,
    client::Client,
    connection::pool::ConnectionPool,
    connection_manager::{friendly::FriendlyPage, Dialer, Listener, ListenerContext},
    endpoint::{Endpoint, EndpointError, EndpointTarget},
    identity::{NodeIdentity, Thumbprint, TrustSet},
    polling::Poller,
    registry::Registry,
    tls::TlsConfig,
};

const LOG_TARGET: &str = "comms::node";

pub struct TetherNode {
    identity: Arc<NodeIdentity>,
    trust: Arc<TrustSet>,
    registry: Arc<Registry>,
    config: RuntimeConfig,
    tls: TlsConfig,
    pool: Arc<ConnectionPool>,
    routes: Arc<crate::polling::PollRoutes>,
    dialer: Dialer,
    friendly: Arc<FriendlyPage>,
    shutdown: Shutdown,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    accepted: Arc<AtomicUsize>,
}

impl TetherNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        identity: Arc<NodeIdentity>,
        trust: Arc<TrustSet>,
        registry: Arc<Registry>,
        config: RuntimeConfig,
        tls: TlsConfig,
        pool: Arc<ConnectionPool>,
        routes: Arc<crate::polling::PollRoutes>,
        dialer: Dialer,
        friendly: Arc<FriendlyPage>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            identity,
            trust,
            registry,
            config,
            tls,
            pool,
            routes,
            dialer,
            friendly,
            shutdown,
            listen_addrs: Mutex::new(Vec::new()),
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The local certificate thumbprint, as peers will observe it.
    pub fn thumbprint(&self) -> Thumbprint {
        self.identity.thumbprint()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.to_signal()
    }

    /// Start listening on an ephemeral local port and return the bound
    /// address.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        self.listen_on(([127, 0, 0, 1], 0).into()).await
    }

    /// Start listening on the given address and return the bound address.
    pub async fn listen_on(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        self.listen_addrs.lock().unwrap().push(local_addr);

        let context = ListenerContext {
            tls: self.tls.clone(),
            trust: self.trust.clone(),
            registry: self.registry.clone(),
            routes: self.routes.clone(),
            friendly: self.friendly.clone(),
            config: self.config.clone(),
            shutdown_signal: self.shutdown.to_signal(),
            accepted: self.accepted.clone(),
        };
        tokio::spawn(Listener::new(context).run(listener));
        Ok(local_addr)
    }

    /// Addresses this node is listening on.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listen_addrs.lock().unwrap().clone()
    }

    /// Total sockets accepted across this node's listeners. One stable TCP
    /// connection serving thousands of calls counts once.
    pub fn inbound_connection_count(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Add a peer thumbprint to the trust set. Effective for all subsequent
    /// handshakes.
    pub fn trust(&self, thumbprint: Thumbprint) {
        self.trust.trust(thumbprint);
    }

    pub fn revoke_trust(&self, thumbprint: &Thumbprint) -> bool {
        self.trust.revoke(thumbprint)
    }

    /// Start polling: dial the remote listener and service the given
    /// subscription as a callee, reconnecting with backoff for the life of
    /// the runtime. Accepts a bare subscription id or a `poll://` URI.
    pub fn poll(&self, subscription: &str, remote: Endpoint) -> Result<(), EndpointError> {
        let subscription_id = subscription
            .strip_prefix("poll://")
            .unwrap_or(subscription)
            .to_string();
        let (host, port) = match remote.target() {
            EndpointTarget::Tls { host, port } => (host.clone(), *port),
            EndpointTarget::Poll { .. } => {
                return Err(EndpointError::PollRemoteNotTls(remote.to_string()))
            },
        };
        info!(
            target: LOG_TARGET,
            "polling {} for subscription '{}'", remote, subscription_id
        );
        let poller = Poller::new(
            subscription_id,
            host,
            port,
            remote.expected_peer(),
            self.dialer.clone(),
            self.registry.clone(),
            self.shutdown.to_signal(),
        );
        tokio::spawn(poller.run());
        Ok(())
    }

    /// A caller bound to the given endpoint.
    pub fn client(&self, endpoint: Endpoint) -> Client {
        Client::new(
            endpoint,
            self.pool.clone(),
            self.dialer.clone(),
            self.routes.clone(),
            self.config.request_deadline,
            self.shutdown.to_signal(),
        )
    }

    /// Replace the friendly-page body served to HTTP clients; an empty
    /// string reverts to the default page.
    pub fn set_friendly_page(&self, body: &str) {
        self.friendly.set_body(body);
    }

    /// Set a header emitted verbatim on friendly-page responses.
    pub fn set_friendly_header(&self, name: &str, value: &str) {
        self.friendly.set_header(name, value);
    }

    /// Orderly shutdown: stop listeners and pollers, fail queued poll calls
    /// and drain the connection pool. In-flight dispatches get the configured
    /// grace period from their listeners.
    pub async fn shutdown(&self) {
        info!(target: LOG_TARGET, "runtime '{}' shutting down", self.thumbprint());
        self.shutdown.trigger();
        self.pool.clear().await;
    }
}

impl std::fmt::Debug for TetherNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherNode")
            .field("thumbprint", &self.thumbprint())
            .field("listen_addrs", &self.listen_addrs())
            .finish()
    }
}
