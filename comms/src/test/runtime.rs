//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

use super::{greeting_registry, init_logging, listening_node, silent_node, trust_both};
use crate::{
    builder::RuntimeConfig,
    connection::pool::{ConnectionPool, PoolConfig},
    connection_manager::Dialer,
    identity::TrustSet,
    registry::{Registry, ServiceResponse},
    test_utils::build_node_identity,
    tls::TlsConfig,
    Endpoint,
    RpcValue,
    RpcError,
    TetherBuilder,
    DEFAULT_FRIENDLY_PAGE,
};

#[tokio::test]
async fn trusted_call_round_trip() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    let endpoint = Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint());
    let client = caller.client(endpoint.clone());

    let result = client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("fleet".to_string())])
        .await
        .unwrap();
    assert_eq!(result, RpcValue::Str("Hello fleet".to_string()));

    // The pinned thumbprint is exactly what the successful call observed
    assert_eq!(endpoint.expected_peer(), server.thumbprint());
}

#[tokio::test]
async fn untrusted_caller_is_rejected() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let stranger = silent_node(Arc::new(Registry::new()));
    // The stranger trusts the server, but not vice versa
    stranger.trust(server.thumbprint());

    let client = stranger.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    let err = client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("x".to_string())])
        .await
        .unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectionClosed | RpcError::HandshakeFailed(_)),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn caller_rejects_unexpected_thumbprint() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    // Expecting the caller's own thumbprint at the server's address
    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), caller.thumbprint()));
    let err = client.invoke("greeter", "say_hello", vec![RpcValue::Null]).await.unwrap_err();
    assert!(matches!(err, RpcError::UntrustedPeer(_)), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn caller_with_empty_trust_set_refuses_to_connect() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    server.trust(caller.thumbprint());

    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    let err = client.invoke("greeter", "say_hello", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::UntrustedPeer(_)), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn plaintext_http_fails_fast_and_listener_stays_healthy() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: tether\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let closed = time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .expect("server must close a plaintext connection within 5s");
    match closed {
        Ok(0) | Err(_) => {},
        Ok(n) => panic!("server answered {} bytes to plaintext HTTP", n),
    }

    // The accept loop is still serving
    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    let result = client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("still here".to_string())])
        .await
        .unwrap();
    assert_eq!(result, RpcValue::Str("Hello still here".to_string()));
}

#[tokio::test]
async fn sequential_calls_reuse_pooled_connections() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    for i in 0..300 {
        let result = client
            .invoke("greeter", "say_hello", vec![RpcValue::Str(i.to_string())])
            .await
            .unwrap();
        assert_eq!(result, RpcValue::Str(format!("Hello {}", i)));
    }

    let accepted = server.inbound_connection_count();
    assert!(accepted >= 1);
    assert!(
        accepted <= 5,
        "300 sequential calls used {} connections; expected at most the pool bound",
        accepted
    );
}

#[tokio::test]
async fn polling_inversion_round_trip() {
    init_logging();
    // The hub only listens; the agent only dials out.
    let (hub, hub_addr) = listening_node(Arc::new(Registry::new())).await;
    let agent = silent_node(greeting_registry());
    trust_both(&hub, &agent);

    agent
        .poll(
            "poll://agent-1",
            Endpoint::tls("127.0.0.1", hub_addr.port(), hub.thumbprint()),
        )
        .unwrap();

    let client = hub.client(Endpoint::poll("agent-1", agent.thumbprint()));

    // Identical observable semantics to the listening direction: results,
    // service errors that do not poison the connection, and not-found errors.
    let result = client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("hub".to_string())])
        .await
        .unwrap();
    assert_eq!(result, RpcValue::Str("Hello hub".to_string()));

    let err = client.invoke("greeter", "fail", vec![]).await.unwrap_err();
    match err {
        RpcError::ServiceInvocation { message, detail } => {
            assert_eq!(message, "I haven't gotten to this yet");
            assert_eq!(detail.as_deref(), Some("at greeter::fail (greeting.rs:12)"));
        },
        other => panic!("unexpected error: {:?}", other),
    }

    let err = client.invoke("greeter", "missing", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::ServiceNotFound(_)));

    // The same dialed-in connection keeps serving
    let result = client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("again".to_string())])
        .await
        .unwrap();
    assert_eq!(result, RpcValue::Str("Hello again".to_string()));
}

#[tokio::test]
async fn request_timeout_destroys_the_connection() {
    init_logging();
    let registry = Registry::new();
    registry.register("slow", "nap", vec![], |_req| async {
        time::sleep(Duration::from_secs(2)).await;
        Ok(ServiceResponse::value(RpcValue::Null))
    });
    registry.register("slow", "quick", vec![], |_req| async {
        Ok(ServiceResponse::value(RpcValue::Bool(true)))
    });
    let (server, addr) = listening_node(Arc::new(registry)).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    let client = caller
        .client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()))
        .with_deadline(Duration::from_millis(200));
    let err = client.invoke("slow", "nap", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    // The timed-out connection was destroyed; the next call dials fresh
    let before = server.inbound_connection_count();
    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    assert_eq!(
        client.invoke("slow", "quick", vec![]).await.unwrap(),
        RpcValue::Bool(true)
    );
    assert_eq!(server.inbound_connection_count(), before + 1);
}

#[tokio::test]
async fn friendly_page_body_and_headers() {
    init_logging();
    let (server, addr) = listening_node(Arc::new(Registry::new())).await;

    async fn fetch(addr: std::net::SocketAddr) -> String {
        let tls = TlsConfig::new(build_node_identity()).unwrap();
        let socket = TcpStream::connect(addr).await.unwrap();
        let (_thumbprint, mut stream) = tls.upgrade_outbound(socket, "127.0.0.1").await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: tether\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    let response = fetch(addr).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with(DEFAULT_FRIENDLY_PAGE));

    server.set_friendly_page("Simple text works too!");
    let response = fetch(addr).await;
    assert!(response.ends_with("Simple text works too!"));
    assert!(!response.contains(DEFAULT_FRIENDLY_PAGE));

    server.set_friendly_page("");
    let response = fetch(addr).await;
    assert!(response.ends_with(DEFAULT_FRIENDLY_PAGE));

    server.set_friendly_header("X-Content-Type-Options", "nosniff");
    server.set_friendly_header("X-Frame-Options", "DENY");
    let response = fetch(addr).await;
    assert!(response.contains("X-Content-Type-Options: nosniff\r\n"));
    assert!(response.contains("X-Frame-Options: DENY\r\n"));
}

#[tokio::test]
async fn pool_release_is_idempotent_and_never_repools_broken() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let identity = build_node_identity();
    server.trust(identity.thumbprint());

    let trust = Arc::new(TrustSet::new());
    trust.trust(server.thumbprint());
    let dialer = Dialer::new(
        TlsConfig::new(identity).unwrap(),
        trust,
        Duration::from_secs(5),
    );
    let pool = ConnectionPool::new(PoolConfig::default());
    let key = "tls://127.0.0.1#test";

    // Broken connections are destroyed on release
    let mut conn = dialer
        .dial("127.0.0.1", addr.port(), server.thumbprint(), None)
        .await
        .unwrap();
    conn.mark_broken();
    pool.checkin(key, conn).await;
    assert_eq!(pool.idle_count(key).await, 0);

    // Idle connections pool once per release, no matter how often they cycle
    let conn = dialer
        .dial("127.0.0.1", addr.port(), server.thumbprint(), None)
        .await
        .unwrap();
    pool.checkin(key, conn).await;
    assert_eq!(pool.idle_count(key).await, 1);
    let conn = pool.checkout(key).await.unwrap();
    assert_eq!(pool.idle_count(key).await, 0);
    pool.checkin(key, conn).await;
    assert_eq!(pool.idle_count(key).await, 1);

    // Overflow past the bound is closed immediately
    for _ in 0..7 {
        let conn = dialer
            .dial("127.0.0.1", addr.port(), server.thumbprint(), None)
            .await
            .unwrap();
        pool.checkin(key, conn).await;
    }
    assert_eq!(pool.idle_count(key).await, PoolConfig::default().max_idle_per_endpoint);
}

#[tokio::test]
async fn poll_queue_overflow_fails_the_enqueue() {
    init_logging();
    let node = TetherBuilder::new()
        .with_node_identity(build_node_identity())
        .with_config(RuntimeConfig {
            poll_queue_capacity: 2,
            ..Default::default()
        })
        .spawn()
        .unwrap();

    let agent_thumbprint = build_node_identity().thumbprint();
    let client = node
        .client(Endpoint::poll("lonely-agent", agent_thumbprint))
        .with_deadline(Duration::from_millis(300));

    // No agent ever dials in: two calls sit in the queue, the third bounces
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("svc", "m", vec![]).await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("svc", "m", vec![]).await }
    });
    time::sleep(Duration::from_millis(50)).await;

    let err = client.invoke("svc", "m", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::QueueFull(id) if id == "lonely-agent"));

    assert!(matches!(first.await.unwrap(), Err(RpcError::Timeout)));
    assert!(matches!(second.await.unwrap(), Err(RpcError::Timeout)));
}

#[tokio::test]
async fn shutdown_fails_new_calls() {
    init_logging();
    let (server, addr) = listening_node(greeting_registry()).await;
    let caller = silent_node(Arc::new(Registry::new()));
    trust_both(&server, &caller);

    let client = caller.client(Endpoint::tls("127.0.0.1", addr.port(), server.thumbprint()));
    client
        .invoke("greeter", "say_hello", vec![RpcValue::Str("x".to_string())])
        .await
        .unwrap();

    caller.shutdown().await;
    let err = client.invoke("greeter", "say_hello", vec![RpcValue::Null]).await.unwrap_err();
    assert!(matches!(err, RpcError::Shutdown));
}
