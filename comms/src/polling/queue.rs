//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::{
    connection::CallReply,
    error::RpcError,
    framing::OutboundStream,
    identity::Thumbprint,
    message::RpcValue,
};

/// A call waiting in a subscription's queue for a dialed-in connection.
pub(crate) struct PendingCall {
    pub service: String,
    pub method: String,
    pub args: Vec<RpcValue>,
    pub streams: Vec<OutboundStream>,
    pub expected_peer: Thumbprint,
    pub deadline: Duration,
    pub reply: oneshot::Sender<Result<CallReply, RpcError>>,
}

/// Bounded FIFO of pending calls for one subscription. Multiple dialed-in
/// connections may service the same subscription; they share the receiver and
/// steal work from it.
#[derive(Clone)]
pub(crate) struct PollQueue {
    tx: mpsc::Sender<PendingCall>,
    rx: Arc<Mutex<mpsc::Receiver<PendingCall>>>,
}

impl PollQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn sender(&self) -> &mpsc::Sender<PendingCall> {
        &self.tx
    }

    pub fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<PendingCall>>> {
        self.rx.clone()
    }
}
