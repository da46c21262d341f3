//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use log::*;
use tokio::time;
use tether_shutdown::ShutdownSignal;

use crate::{
    backoff::{Backoff, ExponentialBackoff},
    connection_manager::Dialer,
    dispatcher::Dispatcher,
    identity::Thumbprint,
    registry::Registry,
};

const LOG_TARGET: &str = "comms::polling::poller";

/// Maintains one outbound connection for a subscription: dial the remote
/// listener, announce the subscription id and then serve requests as a
/// callee. Re-dials with full-jitter exponential backoff whenever the
/// connection is lost; the subscription outlives any single call.
pub(crate) struct Poller {
    subscription_id: String,
    remote_host: String,
    remote_port: u16,
    expected_peer: Thumbprint,
    dialer: Dialer,
    registry: Arc<Registry>,
    backoff: ExponentialBackoff,
    shutdown_signal: ShutdownSignal,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription_id: String,
        remote_host: String,
        remote_port: u16,
        expected_peer: Thumbprint,
        dialer: Dialer,
        registry: Arc<Registry>,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            subscription_id,
            remote_host,
            remote_port,
            expected_peer,
            dialer,
            registry,
            backoff: ExponentialBackoff::default(),
            shutdown_signal,
        }
    }

    pub async fn run(self) {
        let mut attempts = 0usize;
        let mut signal = self.shutdown_signal.clone();
        loop {
            match self
                .dialer
                .dial(
                    &self.remote_host,
                    self.remote_port,
                    self.expected_peer,
                    Some(self.subscription_id.clone()),
                )
                .await
            {
                Ok(conn) => {
                    info!(
                        target: LOG_TARGET,
                        "subscription '{}' connected to {}:{}",
                        self.subscription_id,
                        self.remote_host,
                        self.remote_port
                    );
                    attempts = 0;
                    // Role inversion: this side dialed, but it services
                    // requests until the connection is lost
                    Dispatcher::new(self.registry.clone(), self.shutdown_signal.clone())
                        .serve(conn)
                        .await;
                },
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        "subscription '{}' failed to connect to {}:{}: {}",
                        self.subscription_id,
                        self.remote_host,
                        self.remote_port,
                        err
                    );
                },
            }

            if signal.is_triggered() {
                break;
            }
            attempts += 1;
            let delay = self.backoff.calculate_backoff(attempts);
            debug!(
                target: LOG_TARGET,
                "subscription '{}' re-dialing in {:.1?} (attempt {})",
                self.subscription_id,
                delay,
                attempts
            );
            tokio::select! {
                biased;
                _ = &mut signal => break,
                _ = time::sleep(delay) => {},
            }
        }
        debug!(
            target: LOG_TARGET,
            "poller for subscription '{}' stopped", self.subscription_id
        );
    }
}
