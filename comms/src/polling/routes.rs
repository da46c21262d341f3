//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::{collections::HashMap, sync::Mutex};

use log::*;
use tokio::time;
use tether_shutdown::ShutdownSignal;

use super::queue::{PendingCall, PollQueue};
use crate::{connection::Connection, error::RpcError};

const LOG_TARGET: &str = "comms::polling::routes";

/// Listening-side registry of poll subscriptions: one bounded queue of
/// pending calls per subscription id, serviced by whichever connections have
/// dialed in for it.
pub(crate) struct PollRoutes {
    queues: Mutex<HashMap<String, PollQueue>>,
    queue_capacity: usize,
    shutdown_signal: ShutdownSignal,
}

impl PollRoutes {
    pub fn new(queue_capacity: usize, shutdown_signal: ShutdownSignal) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            queue_capacity,
            shutdown_signal,
        }
    }

    /// The queue for a subscription, created on first use. Queues outlive
    /// connections: requests enqueued during an outage wait for the next
    /// dial-in.
    fn queue(&self, subscription_id: &str) -> PollQueue {
        let mut lock = self.queues.lock().unwrap();
        lock.entry(subscription_id.to_string())
            .or_insert_with(|| PollQueue::new(self.queue_capacity))
            .clone()
    }

    /// Enqueue a pending call without waiting. A full queue fails the call
    /// rather than blocking the caller indefinitely.
    pub fn try_enqueue(&self, subscription_id: &str, call: PendingCall) -> Result<(), RpcError> {
        if self.shutdown_signal.is_triggered() {
            return Err(RpcError::Shutdown);
        }
        let queue = self.queue(subscription_id);
        queue.sender().try_send(call).map_err(|err| match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => {
                warn!(
                    target: LOG_TARGET,
                    "poll queue for subscription '{}' is full", subscription_id
                );
                RpcError::QueueFull(subscription_id.to_string())
            },
            tokio::sync::mpsc::error::TrySendError::Closed(_) => RpcError::Shutdown,
        })
    }

    /// Drive a dialed-in polling connection: pull pending calls off the
    /// subscription's queue and perform them as the caller until the
    /// connection breaks or the runtime shuts down.
    pub async fn attach_connection(&self, subscription_id: &str, mut conn: Connection) {
        let peer = conn.peer_thumbprint();
        let receiver = self.queue(subscription_id).receiver();
        let mut signal = self.shutdown_signal.clone();
        debug!(
            target: LOG_TARGET,
            "connection from peer '{}' now serving subscription '{}'", peer, subscription_id
        );

        loop {
            let call = tokio::select! {
                biased;
                _ = &mut signal => break,
                call = async { receiver.lock().await.recv().await } => match call {
                    Some(call) => call,
                    None => break,
                },
            };

            // The endpoint pins the thumbprint of the peer expected to service
            // the subscription; a different dialed-in peer fails the call and
            // loses the connection.
            if call.expected_peer != peer {
                warn!(
                    target: LOG_TARGET,
                    "subscription '{}' connection peer '{}' does not match the call's expected peer '{}'",
                    subscription_id,
                    peer,
                    call.expected_peer
                );
                let _ = call.reply.send(Err(RpcError::UntrustedPeer(peer)));
                break;
            }

            let result = time::timeout(
                call.deadline,
                conn.exchange(&call.service, &call.method, call.args, call.streams),
            )
            .await;
            match result {
                Ok(outcome) => {
                    let broke = conn.is_broken();
                    let _ = call.reply.send(outcome);
                    if broke {
                        break;
                    }
                },
                Err(_elapsed) => {
                    // In-flight bytes make the connection unsafe to reuse
                    debug!(
                        target: LOG_TARGET,
                        "call on subscription '{}' exceeded its deadline; destroying the connection",
                        subscription_id
                    );
                    let _ = call.reply.send(Err(RpcError::Timeout));
                    break;
                },
            }
        }
        debug!(
            target: LOG_TARGET,
            "connection from peer '{}' detached from subscription '{}'", peer, subscription_id
        );
    }
}
