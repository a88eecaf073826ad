// Graceful-shutdown integration tests.
mod common;

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use egret_proxy::ProxyConfig;
use egret_wire::Command;
use test_harness::client::TestClient;
use test_harness::stub_broker::{LookupBehavior, StubBroker};

use common::{allow_loopback_egress, start_default_proxy, static_discovery};

const TOPIC: &str = "persistent://tenant/ns/topic-0";

#[tokio::test]
async fn shutdown_drains_idle_connections_within_the_deadline() {
    let mut config = ProxyConfig::for_tests();
    config.shutdown_drain_timeout_ms = 5_000;
    let proxy = start_default_proxy(config, None).await;
    let addr = proxy.listen_addr().expect("addr");

    let mut clients = Vec::new();
    for _ in 0..25 {
        clients.push(TestClient::connect(addr, None).await.expect("connect"));
    }
    assert_eq!(proxy.active_connections(), 25);

    let started = Instant::now();
    proxy.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(proxy.connection_count(), 0);
    assert_eq!(proxy.active_connections(), 0);

    // Every client observes the close.
    for mut client in clients {
        assert!(client.recv().await.expect("recv").is_none());
    }

    // And the listener is gone: a fresh connect cannot complete a
    // handshake.
    let refused = match TestClient::connect(addr, None).await {
        Err(_) => true,
        Ok(mut client) => client.recv().await.ok().flatten().is_none(),
    };
    assert!(refused);
}

#[tokio::test]
async fn shutdown_closes_live_splices() {
    let broker = StubBroker::start(LookupBehavior::RespondSelf { authoritative: true })
        .await
        .expect("stub broker");
    let mut config = ProxyConfig::for_tests();
    allow_loopback_egress(&mut config);
    config.shutdown_drain_timeout_ms = 5_000;
    let proxy = start_default_proxy(
        config,
        Some(static_discovery(&[&broker.service_url()])),
    )
    .await;
    let addr = proxy.listen_addr().expect("addr");

    // Establish a handful of live splices.
    let mut streams = Vec::new();
    for i in 0..5u64 {
        let mut client = TestClient::connect(addr, None).await.expect("connect");
        client
            .send(&Command::Producer {
                request_id: i,
                producer_id: i,
                topic: TOPIC.to_string(),
                producer_name: None,
            })
            .await
            .expect("send");
        match client.recv().await.expect("recv") {
            Some(Command::Success { .. }) => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        let mut stream = client.into_inner();
        stream.write_all(b"ping").await.expect("write");
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.expect("echo");
        streams.push(stream);
    }
    assert_eq!(proxy.active_connections(), 5);

    proxy.shutdown().await;
    assert_eq!(proxy.connection_count(), 0);
    assert_eq!(proxy.active_connections(), 0);

    for mut stream in streams {
        let mut rest = Vec::new();
        // The proxy tore the splice down; the socket reaches EOF or error.
        let _ = stream.read_to_end(&mut rest).await;
    }
}
