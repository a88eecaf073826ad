// Session-level behavior: keep-alive and idle timeout.
mod common;

use std::time::Duration;

use egret_proxy::ProxyConfig;
use egret_wire::{Command, DEFAULT_MAX_FRAME_BYTES, read_command};
use test_harness::client::TestClient;

use common::start_default_proxy;

#[tokio::test]
async fn proxy_pings_idle_clients() {
    let mut config = ProxyConfig::for_tests();
    config.keep_alive_interval_seconds = 1;
    let proxy = start_default_proxy(config, None).await;

    let mut client = TestClient::connect(proxy.listen_addr().expect("addr"), None)
        .await
        .expect("connect");
    let next = tokio::time::timeout(
        Duration::from_secs(3),
        read_command(client.stream_mut(), DEFAULT_MAX_FRAME_BYTES),
    )
    .await
    .expect("ping within the interval")
    .expect("read");
    assert!(matches!(next, Some((Command::Ping, _))));
    proxy.shutdown().await;
}

#[tokio::test]
async fn unanswered_pings_close_the_connection() {
    let mut config = ProxyConfig::for_tests();
    config.keep_alive_interval_seconds = 1;
    let proxy = start_default_proxy(config, None).await;

    let mut client = TestClient::connect(proxy.listen_addr().expect("addr"), None)
        .await
        .expect("connect");
    // Never answer; after two missed intervals the proxy hangs up.
    let closed = tokio::time::timeout(Duration::from_secs(6), async {
        loop {
            match read_command(client.stream_mut(), DEFAULT_MAX_FRAME_BYTES).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection should close after missed pings");
    proxy.shutdown().await;
}

#[tokio::test]
async fn idle_timeout_closes_quiet_connections() {
    let mut config = ProxyConfig::for_tests();
    config.idle_timeout_seconds = 1;
    let proxy = start_default_proxy(config, None).await;

    let mut client = TestClient::connect(proxy.listen_addr().expect("addr"), None)
        .await
        .expect("connect");
    let closed = tokio::time::timeout(Duration::from_secs(4), client.recv()).await;
    match closed {
        Ok(Ok(None)) => {}
        other => panic!("expected close, got {other:?}"),
    }
    proxy.shutdown().await;
}
