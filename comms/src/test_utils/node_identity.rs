//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use crate::identity::NodeIdentity;

/// Generate a fresh self-signed identity. Chain validity is irrelevant to the
/// runtime; only the thumbprint matters.
pub fn build_node_identity() -> Arc<NodeIdentity> {
    let certified = rcgen::generate_simple_self_signed(vec!["node.tether.test".to_string()])
        .expect("self-signed certificate generation cannot fail");
    Arc::new(NodeIdentity::new(
        certified.cert.der().to_vec(),
        certified.key_pair.serialize_der(),
    ))
}
