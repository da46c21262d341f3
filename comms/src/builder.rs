//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use tether_shutdown::Shutdown;

use crate::{
    connection::pool::{ConnectionPool, PoolConfig},
    connection_manager::{friendly::FriendlyPage, Dialer},
    identity::{NodeIdentity, Thumbprint, TrustSet},
    node::TetherNode,
    polling::PollRoutes,
    registry::Registry,
    tls::{TlsConfig, TlsError},
};

/// Tunables for a runtime. The defaults are production values; tests override
/// the ones they exercise.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Hard deadline for TLS plus the identity exchange.
    pub handshake_deadline: Duration,
    /// How long an accepted socket may stay silent before the plaintext
    /// sniff gives up and TLS is attempted anyway.
    pub plaintext_peek_deadline: Duration,
    /// Soft bound on idle pooled connections per endpoint.
    pub pool_bound: usize,
    /// Pooled connections idle longer than this are discarded.
    pub pool_idle_deadline: Duration,
    /// Pending calls per poll subscription before enqueues fail.
    pub poll_queue_capacity: usize,
    /// Default per-request deadline for clients.
    pub request_deadline: Duration,
    /// How long in-flight dispatches may run after shutdown is triggered.
    pub shutdown_grace: Duration,
    /// Upper bound on sockets concurrently mid-upgrade per listener.
    pub max_concurrent_inbound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            handshake_deadline: Duration::from_secs(30),
            plaintext_peek_deadline: Duration::from_millis(500),
            pool_bound: 5,
            pool_idle_deadline: Duration::from_secs(60),
            poll_queue_capacity: 1000,
            request_deadline: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            max_concurrent_inbound: 100,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a node identity is required")]
    MissingNodeIdentity,
    #[error("failed to build the TLS configuration: {0}")]
    Tls(#[from] TlsError),
}

/// Assembles a [`TetherNode`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tether_comms::{Registry, TetherBuilder, NodeIdentity};
/// # fn example(identity: Arc<NodeIdentity>, registry: Arc<Registry>) {
/// let node = TetherBuilder::new()
///     .with_node_identity(identity)
///     .with_registry(registry)
///     .spawn()
///     .unwrap();
/// # }
/// ```
#[derive(Default)]
pub struct TetherBuilder {
    identity: Option<Arc<NodeIdentity>>,
    trusted: Vec<Thumbprint>,
    registry: Option<Arc<Registry>>,
    config: RuntimeConfig,
}

impl TetherBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_node_identity(mut self, identity: Arc<NodeIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// The registry consulted for inbound requests. A node without one can
    /// still act as a pure caller.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn add_trusted_peer(mut self, thumbprint: Thumbprint) -> Self {
        self.trusted.push(thumbprint);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime. Listeners and pollers are started afterwards
    /// through the node's own methods.
    pub fn spawn(self) -> Result<TetherNode, BuildError> {
        let identity = self.identity.ok_or(BuildError::MissingNodeIdentity)?;
        let registry = self.registry.unwrap_or_default();

        let trust = Arc::new(TrustSet::new());
        for thumbprint in self.trusted {
            trust.trust(thumbprint);
        }

        let tls = TlsConfig::new(identity.clone())?;
        let shutdown = Shutdown::new();
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_endpoint: self.config.pool_bound,
            idle_deadline: self.config.pool_idle_deadline,
        }));
        let routes = Arc::new(PollRoutes::new(
            self.config.poll_queue_capacity,
            shutdown.to_signal(),
        ));
        let dialer = Dialer::new(tls.clone(), trust.clone(), self.config.handshake_deadline);
        let friendly = Arc::new(FriendlyPage::new());

        Ok(TetherNode::new(
            identity,
            trust,
            registry,
            self.config,
            tls,
            pool,
            routes,
            dialer,
            friendly,
            shutdown,
        ))
    }
}
