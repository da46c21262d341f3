//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! The caller-side entry point.
//!
//! A [`Client`] is bound to one endpoint. For `tls://` endpoints it checks a
//! connection out of the pool (dialing when empty), performs one strictly
//! alternating exchange and returns the connection. For `poll://` endpoints
//! it enqueues the call on the subscription's queue and waits for a dialed-in
//! connection to carry it. Faulted connections are destroyed, never retried.

use std::{sync::Arc, time::Duration};

use log::*;
use tokio::{sync::oneshot, time};
use tether_shutdown::ShutdownSignal;

use crate::{
    connection::{pool::ConnectionPool, CallReply},
    connection_manager::Dialer,
    endpoint::{Endpoint, EndpointTarget},
    error::RpcError,
    framing::OutboundStream,
    message::RpcValue,
    polling::{PendingCall, PollRoutes},
};

const LOG_TARGET: &str = "comms::client";

#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    dialer: Dialer,
    routes: Arc<PollRoutes>,
    deadline: Duration,
    shutdown_signal: ShutdownSignal,
}

impl Client {
    pub(crate) fn new(
        endpoint: Endpoint,
        pool: Arc<ConnectionPool>,
        dialer: Dialer,
        routes: Arc<PollRoutes>,
        deadline: Duration,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            endpoint,
            pool,
            dialer,
            routes,
            deadline,
            shutdown_signal,
        }
    }

    /// Override the per-request deadline for calls made through this client.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Invoke a method and return its result value. Sugar over [`call`] for
    /// calls without stream attachments.
    ///
    /// [`call`]: Client::call
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue, RpcError> {
        self.call(service, method, args, Vec::new())
            .await
            .map(|reply| reply.value)
    }

    /// Invoke a method with stream attachments, returning the result value
    /// and any response-direction streams.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
        streams: Vec<OutboundStream>,
    ) -> Result<CallReply, RpcError> {
        if self.shutdown_signal.is_triggered() {
            return Err(RpcError::Shutdown);
        }
        match self.endpoint.target() {
            EndpointTarget::Tls { host, port } => {
                self.call_listening(host, *port, service, method, args, streams).await
            },
            EndpointTarget::Poll { subscription_id } => {
                self.call_polling(subscription_id, service, method, args, streams).await
            },
        }
    }

    async fn call_listening(
        &self,
        host: &str,
        port: u16,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
        streams: Vec<OutboundStream>,
    ) -> Result<CallReply, RpcError> {
        let key = self.endpoint.pool_key();
        let mut conn = match self.pool.checkout(&key).await {
            Some(conn) => conn,
            None => self
                .dialer
                .dial(host, port, self.endpoint.expected_peer(), None)
                .await?,
        };
        if conn.peer_thumbprint() != self.endpoint.expected_peer() {
            return Err(RpcError::UntrustedPeer(conn.peer_thumbprint()));
        }

        match time::timeout(self.deadline, conn.exchange(service, method, args, streams)).await {
            Ok(result) => {
                // A broken connection is dropped here rather than pooled
                self.pool.checkin(&key, conn).await;
                result
            },
            Err(_elapsed) => {
                debug!(
                    target: LOG_TARGET,
                    "request to {} exceeded the {:.0?} deadline; destroying the connection",
                    self.endpoint,
                    self.deadline
                );
                drop(conn);
                Err(RpcError::Timeout)
            },
        }
    }

    async fn call_polling(
        &self,
        subscription_id: &str,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
        streams: Vec<OutboundStream>,
    ) -> Result<CallReply, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.routes.try_enqueue(subscription_id, PendingCall {
            service: service.to_string(),
            method: method.to_string(),
            args,
            streams,
            expected_peer: self.endpoint.expected_peer(),
            deadline: self.deadline,
            reply: reply_tx,
        })?;

        // The deadline covers both the wait for a dialed-in connection and
        // the exchange itself
        match time::timeout(self.deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv)) => Err(RpcError::Shutdown),
            Err(_elapsed) => {
                debug!(
                    target: LOG_TARGET,
                    "poll call on subscription '{}' exceeded the {:.0?} deadline",
                    subscription_id,
                    self.deadline
                );
                Err(RpcError::Timeout)
            },
        }
    }
}
