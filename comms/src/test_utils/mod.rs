//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Helpers for tests and examples.

pub mod node_identity;

pub use node_identity::build_node_identity;
