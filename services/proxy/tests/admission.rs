// Admission-control integration tests.
mod common;

use egret_proxy::ProxyConfig;
use egret_proxy::observability;
use test_harness::client::TestClient;

use common::start_default_proxy;

#[tokio::test]
async fn global_cap_rejects_the_third_connection() {
    // The only metrics-asserting test in this binary: the recorder is
    // process-global and can be installed once.
    let metrics = observability::init_test_recorder();

    let mut config = ProxyConfig::for_tests();
    config.max_concurrent_inbound_connections = 2;
    let proxy = start_default_proxy(config, None).await;
    let addr = proxy.listen_addr().expect("addr");

    let first = TestClient::connect(addr, None).await.expect("first");
    let second = TestClient::connect(addr, None).await.expect("second");

    // The third socket is accepted at the TCP level and closed immediately
    // without any frame.
    let mut third = TestClient::open(addr).await.expect("open");
    let observed = third.recv().await.expect("read");
    assert!(observed.is_none(), "rejected connection must see bare close");

    assert_eq!(proxy.active_connections(), 2);
    let rendered = metrics.render();
    assert!(
        rendered.contains("pulsar_proxy_rejected_connections"),
        "{rendered}"
    );

    drop(first);
    drop(second);
    proxy.shutdown().await;
}

#[tokio::test]
async fn zero_cap_rejects_every_connection() {
    let mut config = ProxyConfig::for_tests();
    config.max_concurrent_inbound_connections = 0;
    let proxy = start_default_proxy(config, None).await;
    let addr = proxy.listen_addr().expect("addr");

    for _ in 0..3 {
        let mut client = TestClient::open(addr).await.expect("open");
        assert!(client.recv().await.expect("read").is_none());
    }
    assert_eq!(proxy.active_connections(), 0);
    proxy.shutdown().await;
}

#[tokio::test]
async fn per_ip_cap_is_independent_of_global_cap() {
    let mut config = ProxyConfig::for_tests();
    config.max_concurrent_inbound_connections = 100;
    config.max_concurrent_inbound_connections_per_ip = 1;
    let proxy = start_default_proxy(config, None).await;
    let addr = proxy.listen_addr().expect("addr");

    // Everything in this test comes from 127.0.0.1, so the second
    // connection trips the per-IP cap long before the global one.
    let first = TestClient::connect(addr, None).await.expect("first");
    let mut second = TestClient::open(addr).await.expect("open");
    assert!(second.recv().await.expect("read").is_none());
    assert_eq!(proxy.active_connections(), 1);

    // Releasing the slot lets the next connection in.
    drop(first);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let _third = TestClient::connect(addr, None).await.expect("third");

    proxy.shutdown().await;
}
