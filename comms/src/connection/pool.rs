//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Per-endpoint cache of idle connections.
//!
//! LIFO: the most recently released connection is reused first, keeping warm
//! sockets warm. Checkout transfers sole ownership to the caller; checkin
//! returns a connection only if it is Idle, young enough and still connected.
//! Everything else is destroyed on the spot, so a Broken connection can never
//! re-enter the pool.

use std::{collections::HashMap, time::Duration};

use log::*;
use tokio::sync::Mutex;

use super::{Connection, ConnectionState};

const LOG_TARGET: &str = "comms::connection::pool";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft bound on idle connections per endpoint; overflow is closed on
    /// checkin.
    pub max_idle_per_endpoint: usize,
    /// Idle entries older than this are discarded at checkout.
    pub idle_deadline: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_endpoint: 5,
            idle_deadline: Duration::from_secs(60),
        }
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    inner: Mutex<HashMap<String, Vec<Connection>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Pop the most recently released idle connection for the endpoint,
    /// discarding stale or disconnected entries along the way. `None` means
    /// the caller must dial.
    pub async fn checkout(&self, key: &str) -> Option<Connection> {
        let mut lock = self.inner.lock().await;
        let entries = lock.get_mut(key)?;
        while let Some(conn) = entries.pop() {
            if conn.state() != ConnectionState::Idle {
                debug!(
                    target: LOG_TARGET,
                    "discarding pooled connection to {} in state {:?}",
                    key,
                    conn.state()
                );
                continue;
            }
            if conn.idle_age() > self.config.idle_deadline {
                debug!(
                    target: LOG_TARGET,
                    "discarding pooled connection to {} idle for {:.0?}",
                    key,
                    conn.idle_age()
                );
                continue;
            }
            if conn.is_disconnected() {
                debug!(
                    target: LOG_TARGET,
                    "discarding pooled connection to {}: socket disconnected", key
                );
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Return a connection to the pool. Anything that is not Idle, and any
    /// overflow past the per-endpoint bound, is destroyed. Safe to call with
    /// broken connections; the call is then a no-op destroy.
    pub async fn checkin(&self, key: &str, mut conn: Connection) {
        if conn.state() != ConnectionState::Idle {
            debug!(
                target: LOG_TARGET,
                "destroying connection to {} on release (state {:?})",
                key,
                conn.state()
            );
            return;
        }
        conn.touch();
        let mut lock = self.inner.lock().await;
        let entries = lock.entry(key.to_string()).or_default();
        if entries.len() >= self.config.max_idle_per_endpoint {
            debug!(
                target: LOG_TARGET,
                "pool for {} is full ({} idle); closing released connection",
                key,
                entries.len()
            );
            return;
        }
        entries.push(conn);
    }

    pub async fn idle_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every pooled connection. Called at runtime shutdown.
    pub async fn clear(&self) {
        let mut lock = self.inner.lock().await;
        let drained: usize = lock.values().map(Vec::len).sum();
        lock.clear();
        if drained > 0 {
            debug!(target: LOG_TARGET, "drained {} pooled connection(s)", drained);
        }
    }
}
