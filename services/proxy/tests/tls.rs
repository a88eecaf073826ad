// TLS listener integration test with self-signed material.
mod common;

use egret_proxy::ProxyConfig;
use egret_proxy::tls::{build_backend_connector, server_name};
use egret_wire::{Command, PROTOCOL_VERSION, read_command, write_command};
use test_harness::tls::write_self_signed;

use common::start_default_proxy;

#[tokio::test]
async fn tls_listener_serves_the_handshake() {
    let dir = std::env::temp_dir().join(format!("egret-proxy-tls-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let (cert_path, key_path) = write_self_signed(&dir, "localhost").expect("tls material");

    let mut config = ProxyConfig::for_tests();
    config.service_port = None;
    config.service_port_tls = Some(0);
    config.tls_cert_path = Some(cert_path);
    config.tls_key_path = Some(key_path);
    let proxy = start_default_proxy(config, None).await;
    let addr = proxy.listen_addr_tls().expect("tls addr");
    assert!(proxy.listen_addr().is_none());

    // The self-signed certificate is fine for this test; skip verification.
    let connector = build_backend_connector(None, false).expect("connector");
    let socket = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let mut stream = connector
        .connect(server_name("localhost").expect("name"), socket)
        .await
        .expect("tls handshake");

    write_command(
        &mut stream,
        &Command::Connect {
            client_version: "test-harness/0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            auth_method: None,
            auth_data: None,
            original_principal: None,
        },
    )
    .await
    .expect("send connect");
    match read_command(&mut stream, egret_wire::DEFAULT_MAX_FRAME_BYTES)
        .await
        .expect("read")
    {
        Some((Command::Connected { protocol_version, .. }, _)) => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    proxy.shutdown().await;
}

#[tokio::test]
async fn tls_lookup_rewrite_points_at_the_tls_listener() {
    use test_harness::stub_broker::{LookupBehavior, StubBroker};

    let dir = std::env::temp_dir().join(format!("egret-proxy-tls2-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let (cert_path, key_path) = write_self_signed(&dir, "localhost").expect("tls material");

    let broker = StubBroker::start(LookupBehavior::Respond {
        broker_service_url: "pulsar://broker-a:6650".to_string(),
        authoritative: true,
    })
    .await
    .expect("stub broker");

    let mut config = ProxyConfig::for_tests();
    config.service_port = None;
    config.service_port_tls = Some(0);
    config.tls_cert_path = Some(cert_path);
    config.tls_key_path = Some(key_path);
    let proxy = start_default_proxy(
        config,
        Some(common::static_discovery(&[&broker.service_url()])),
    )
    .await;
    let addr = proxy.listen_addr_tls().expect("tls addr");

    let connector = build_backend_connector(None, false).expect("connector");
    let socket = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let mut stream = connector
        .connect(server_name("localhost").expect("name"), socket)
        .await
        .expect("tls handshake");
    write_command(
        &mut stream,
        &Command::Connect {
            client_version: "test-harness/0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            auth_method: None,
            auth_data: None,
            original_principal: None,
        },
    )
    .await
    .expect("send connect");
    let connected = read_command(&mut stream, egret_wire::DEFAULT_MAX_FRAME_BYTES)
        .await
        .expect("read");
    assert!(matches!(connected, Some((Command::Connected { .. }, _))));

    write_command(
        &mut stream,
        &Command::Lookup {
            request_id: 1,
            topic: "persistent://tenant/ns/topic-0".to_string(),
            authoritative: false,
        },
    )
    .await
    .expect("send lookup");
    match read_command(&mut stream, egret_wire::DEFAULT_MAX_FRAME_BYTES)
        .await
        .expect("read")
    {
        Some((
            Command::LookupResponse {
                broker_service_url,
                broker_service_url_tls,
                proxy_through_service_url,
                ..
            },
            _,
        )) => {
            // A TLS client is steered to the TLS listener only.
            assert!(proxy_through_service_url);
            assert_eq!(broker_service_url, None);
            let tls_url = broker_service_url_tls.expect("tls url");
            assert!(tls_url.starts_with("pulsar+ssl://"), "{tls_url}");
            assert!(tls_url.ends_with(&addr.port().to_string()), "{tls_url}");
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    proxy.shutdown().await;
}
