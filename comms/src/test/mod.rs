//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! End-to-end tests over real sockets: two or more runtimes on loopback,
//! exercising both orientations, pooling, streaming and overload routing.

mod runtime;

use std::{net::SocketAddr, sync::Arc};

use crate::{
    registry::{InvocationError, ParamType, Registry, ServiceResponse},
    message::RpcValue,
    test_utils::build_node_identity,
    TetherBuilder, TetherNode,
};

pub(super) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A node with the given registry, listening on an ephemeral loopback port.
pub(super) async fn listening_node(registry: Arc<Registry>) -> (TetherNode, SocketAddr) {
    let node = TetherBuilder::new()
        .with_node_identity(build_node_identity())
        .with_registry(registry)
        .spawn()
        .unwrap();
    let addr = node.listen().await.unwrap();
    (node, addr)
}

/// A node with the given registry and no listener; used as the polling side.
pub(super) fn silent_node(registry: Arc<Registry>) -> TetherNode {
    TetherBuilder::new()
        .with_node_identity(build_node_identity())
        .with_registry(registry)
        .spawn()
        .unwrap()
}

/// Mutual trust between two runtimes.
pub(super) fn trust_both(a: &TetherNode, b: &TetherNode) {
    a.trust(b.thumbprint());
    b.trust(a.thumbprint());
}

pub(super) fn greeting_registry() -> Arc<Registry> {
    let registry = Registry::new();
    registry.register("greeter", "say_hello", vec![ParamType::Str], |req| async move {
        let name = req.args[0].as_str().unwrap_or_default().to_string();
        Ok(ServiceResponse::value(RpcValue::Str(format!("Hello {}", name))))
    });
    registry.register("greeter", "fail", vec![], |_req| async {
        Err(InvocationError::new("I haven't gotten to this yet")
            .with_detail("at greeter::fail (greeting.rs:12)"))
    });
    Arc::new(registry)
}
