//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Shutdown signalling.
//!
//! A [`Shutdown`] owns the trigger; any number of cloned [`ShutdownSignal`]s
//! resolve once it fires. Signals are futures, so tasks can `select!` on them
//! directly. Triggering is idempotent and the trigger also fires on drop, which
//! gives runtime owners scoped-lifetime cleanup for free.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{FusedFuture, Shared},
    FutureExt,
};

/// Owns the shutdown trigger.
#[derive(Debug, Clone)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: ShutdownSignal {
                inner: rx.shared(),
            },
        }
    }

    /// Fire the shutdown signal. Subsequent calls are no-ops.
    pub fn trigger(&self) {
        let mut lock = self.trigger.lock().unwrap();
        if let Some(tx) = lock.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger.lock().unwrap().is_none()
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        // Only the last owner of the trigger fires it
        if Arc::strong_count(&self.trigger) == 1 {
            self.trigger();
        }
    }
}

/// Resolves once the matching [`Shutdown`] is triggered or dropped.
#[derive(Debug, Clone)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ShutdownSignal {
    inner: Shared<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    /// True if the signal has fired. Does not require polling.
    pub fn is_triggered(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Wait for the signal to fire.
    pub async fn wait(&mut self) {
        self.await
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.inner.is_terminated() {
            return Poll::Ready(());
        }
        match Pin::new(&mut self.inner).poll(cx) {
            // Either an explicit trigger or a dropped `Shutdown` resolves the signal
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for ShutdownSignal {
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

/// A signal that may be absent. An absent signal never resolves, which lets
/// builders treat "no shutdown configured" uniformly.
#[derive(Debug, Clone, Default)]
pub struct OptionalShutdownSignal(Option<ShutdownSignal>);

impl OptionalShutdownSignal {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_triggered(&self) -> bool {
        self.0.as_ref().map(ShutdownSignal::is_triggered).unwrap_or(false)
    }
}

impl From<Option<ShutdownSignal>> for OptionalShutdownSignal {
    fn from(inner: Option<ShutdownSignal>) -> Self {
        Self(inner)
    }
}

impl From<ShutdownSignal> for OptionalShutdownSignal {
    fn from(inner: ShutdownSignal) -> Self {
        Self(Some(inner))
    }
}

impl Future for OptionalShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.0.as_mut() {
            Some(signal) => Pin::new(signal).poll(cx),
            None => Poll::Pending,
        }
    }
}
