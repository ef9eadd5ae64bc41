//! End-to-end echo scenarios over the software fabric.

use std::sync::Arc;
use std::time::Duration;

use rclink_fabric::sim::SimFabric;
use rclink_transport::client;
use rclink_transport::config::{ClientConfig, ServerConfig};
use rclink_transport::error::TransportError;
use rclink_transport::server::{Server, ServerHandle};

fn start_server(fabric: &Arc<SimFabric>, addr: &str, max_connections: usize) -> ServerHandle {
    let config = ServerConfig {
        listen_addr: addr.to_string(),
        max_connections,
        ..ServerConfig::default()
    };
    Server::new(Arc::clone(fabric), config)
        .spawn()
        .expect("listen failed")
}

/// Poll until the server settles at `want` connections.
async fn wait_for_active(handle: &ServerHandle, want: usize) {
    for _ in 0..200 {
        if handle.active_connections() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "server never reached {want} active connections (at {})",
        handle.active_connections()
    );
}

#[tokio::test]
async fn test_echo_round_trip_and_clean_teardown() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.1:20079", 10);

    let mut conn = client::connect(Arc::clone(&fabric), "10.0.0.1:20079", ClientConfig::default())
        .await
        .expect("connect failed");
    wait_for_active(&handle, 1).await;

    for msg in [&b"hello"[..], b"x", &[0xAAu8; 1024]] {
        let reply = conn.request(msg).await.expect("request failed");
        assert_eq!(&reply[..], msg);
    }

    conn.disconnect().expect("disconnect failed");
    wait_for_active(&handle, 0).await;
    handle.shutdown().await.expect("shutdown failed");

    let stats = fabric.stats();
    assert!(stats.balanced(), "resource counters not balanced: {stats:?}");
    assert_eq!(stats.completions_dropped, 0);
}

#[tokio::test]
async fn test_capacity_rejection_leaves_first_connection_working() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.2:20079", 1);

    let mut first = client::connect(Arc::clone(&fabric), "10.0.0.2:20079", ClientConfig::default())
        .await
        .expect("first connect failed");
    wait_for_active(&handle, 1).await;

    let short = ClientConfig {
        response_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    match client::connect(Arc::clone(&fabric), "10.0.0.2:20079", short).await {
        Err(TransportError::Rejected { .. }) => {}
        other => panic!("expected rejection, got {:?}", other.map(|c| c.id())),
    }

    let reply = first.request(b"still here").await.expect("request failed");
    assert_eq!(&reply[..], b"still here");
    assert_eq!(handle.active_connections(), 1);

    first.disconnect().expect("disconnect failed");
    handle.shutdown().await.expect("shutdown failed");
    assert!(fabric.stats().balanced());
}

#[tokio::test]
async fn test_completion_error_isolates_the_failing_connection() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.3:20079", 10);

    let mut doomed =
        client::connect(Arc::clone(&fabric), "10.0.0.3:20079", ClientConfig::default())
            .await
            .expect("connect failed");
    let mut healthy =
        client::connect(Arc::clone(&fabric), "10.0.0.3:20079", ClientConfig::default())
            .await
            .expect("connect failed");
    wait_for_active(&handle, 2).await;

    let server_qp = fabric
        .peer_qp(doomed.qp().unwrap())
        .expect("no server peer qp");
    fabric
        .inject_completion_error(server_qp)
        .expect("injection failed");
    wait_for_active(&handle, 1).await;

    let reply = healthy.request(b"unaffected").await.expect("request failed");
    assert_eq!(&reply[..], b"unaffected");

    // The dead connection fails fast rather than hanging.
    let err = doomed.request(b"anyone?").await.expect_err("peer is gone");
    assert!(
        matches!(
            err,
            TransportError::CompletionFailed { .. } | TransportError::Timeout { .. }
        ),
        "unexpected error: {err:?}"
    );

    drop(doomed);
    healthy.disconnect().expect("disconnect failed");
    wait_for_active(&handle, 0).await;
    handle.shutdown().await.expect("shutdown failed");
    assert!(fabric.stats().balanced());
}

#[tokio::test]
async fn test_shutdown_with_live_connections_releases_everything() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.4:20079", 10);

    let mut conns = Vec::new();
    for _ in 0..3 {
        let conn = client::connect(Arc::clone(&fabric), "10.0.0.4:20079", ClientConfig::default())
            .await
            .expect("connect failed");
        conns.push(conn);
    }
    wait_for_active(&handle, 3).await;

    handle.shutdown().await.expect("shutdown failed");

    // Clients still hold their ends; once dropped, everything balances.
    drop(conns);
    let stats = fabric.stats();
    assert!(stats.balanced(), "resource counters not balanced: {stats:?}");
}

#[tokio::test]
async fn test_receive_stands_before_establishment_is_signaled() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.6:20079", 10);
    assert_eq!(fabric.stats().recvs_posted, 0);

    let mut conn = client::connect(Arc::clone(&fabric), "10.0.0.6:20079", ClientConfig::default())
        .await
        .expect("connect failed");

    // connect() returning means the peer signaled establishment. The client
    // posts its reply receives per request, so the one standing receive at
    // this point is the server's, in place before accept.
    assert_eq!(fabric.stats().recvs_posted, 1);

    let reply = conn.request(b"first").await.expect("request failed");
    assert_eq!(&reply[..], b"first");

    conn.disconnect().expect("disconnect failed");
    handle.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_standing_receive_is_reposted_per_echo() {
    let fabric = Arc::new(SimFabric::new());
    let handle = start_server(&fabric, "10.0.0.5:20079", 10);

    let mut conn = client::connect(Arc::clone(&fabric), "10.0.0.5:20079", ClientConfig::default())
        .await
        .expect("connect failed");
    wait_for_active(&handle, 1).await;

    let before = fabric.stats().recvs_posted;
    for i in 0..5u8 {
        conn.request(&[i; 16]).await.expect("request failed");
    }
    // One server repost and one client reply buffer per echo.
    assert_eq!(fabric.stats().recvs_posted, before + 10);

    conn.disconnect().expect("disconnect failed");
    handle.shutdown().await.expect("shutdown failed");
}
