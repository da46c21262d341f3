//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! The polling inversion.
//!
//! A polling participant dials out to a listener, announces a subscription id
//! and then services calls as a callee over the dialed socket. On the
//! listening side the accepted socket belongs to the *caller*: it is attached
//! to a per-subscription route where queued requests wait for a connection to
//! carry them. The two halves never share a socket across roles; everything
//! crosses the boundary as messages through the subscription's queue.

mod poller;
mod queue;
mod routes;

pub(crate) use poller::Poller;
pub(crate) use queue::PendingCall;
pub(crate) use routes::PollRoutes;
