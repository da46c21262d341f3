//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! The callee loop.
//!
//! Runs on any connection whose local side services requests: listening-side
//! inbound connections and polling-side dialed connections alike. Strictly
//! alternating: one request is fully answered, attachments included, before
//! the next is read.

use log::*;
use tether_shutdown::ShutdownSignal;
use std::sync::Arc;

use crate::{
    connection::Connection,
    framing::FramingError,
    message::{ErrorDescriptor, RemoteErrorKind, RequestFrame, ResponseFrame, RpcValue},
    registry::{Registry, ServiceRequest},
};

const LOG_TARGET: &str = "comms::dispatcher";

pub struct Dispatcher {
    registry: Arc<Registry>,
    shutdown_signal: ShutdownSignal,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, shutdown_signal: ShutdownSignal) -> Self {
        Self {
            registry,
            shutdown_signal,
        }
    }

    /// Service requests on the connection until it closes, faults or the
    /// runtime shuts down. Consumes the connection; a connection that leaves
    /// this loop is never reused.
    pub async fn serve(&self, mut conn: Connection) {
        let peer = conn.peer_thumbprint();
        debug!(target: LOG_TARGET, "callee session started for peer '{}'", peer);
        let mut signal = self.shutdown_signal.clone();
        loop {
            let request = tokio::select! {
                biased;
                _ = &mut signal => {
                    debug!(target: LOG_TARGET, "callee session for peer '{}' stopping: shutdown", peer);
                    break;
                },
                result = conn.read_request() => match result {
                    Ok(request) => request,
                    Err(FramingError::ConnectionClosed) => {
                        debug!(target: LOG_TARGET, "peer '{}' closed the connection", peer);
                        conn.mark_broken();
                        break;
                    },
                    Err(err) => {
                        warn!(
                            target: LOG_TARGET,
                            "callee session for peer '{}' failed reading a request: {}", peer, err
                        );
                        conn.mark_broken();
                        break;
                    },
                },
            };

            if let Err(err) = self.handle(&mut conn, request).await {
                warn!(
                    target: LOG_TARGET,
                    "callee session for peer '{}' ended on a transport fault: {}", peer, err
                );
                conn.mark_broken();
                break;
            }
        }
        debug!(target: LOG_TARGET, "callee session for peer '{}' terminated", peer);
    }

    /// Handle one request end-to-end. An `Err` here is a transport or
    /// protocol fault; handler failures are answered in-band and return `Ok`.
    async fn handle(&self, conn: &mut Connection, request: RequestFrame) -> Result<(), FramingError> {
        let request_id = request.request_id;
        let shapes: Vec<_> = request.args.iter().map(RpcValue::shape).collect();

        let method = match self.registry.resolve(&request.service, &request.method, &shapes) {
            Ok(method) => method,
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    "request #{} did not resolve: {}", request_id, err
                );
                // The declared attachments still have to come off the wire
                conn.pump_attachments(Vec::new()).await?;
                return conn
                    .write_response(
                        ResponseFrame {
                            request_id,
                            result: Err(err.to_descriptor()),
                            stream_ids: vec![],
                        },
                        vec![],
                    )
                    .await;
            },
        };

        let (streams, senders) = Connection::make_inbound_streams(&request.stream_ids);
        let service_request = ServiceRequest {
            method: request.method,
            args: request.args,
            streams,
        };

        // The handler consumes attachment chunks while the connection task
        // reads them off the wire; the bounded channels tie the two rates
        // together.
        let (handler_result, pump_result) = tokio::join!(method.invoke(service_request), conn.pump_attachments(senders));
        pump_result?;

        match handler_result {
            Ok(response) => {
                let stream_ids = response.streams.iter().map(|s| s.id()).collect();
                conn.write_response(
                    ResponseFrame {
                        request_id,
                        result: Ok(response.value),
                        stream_ids,
                    },
                    response.streams,
                )
                .await
            },
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    "handler for request #{} returned an error: {}", request_id, err
                );
                conn.write_response(
                    ResponseFrame {
                        request_id,
                        result: Err(ErrorDescriptor {
                            kind: RemoteErrorKind::ServiceInvocation,
                            message: err.message,
                            detail: err.detail,
                        }),
                        stream_ids: vec![],
                    },
                    vec![],
                )
                .await
            },
        }
    }
}
