// Shared setup for proxy integration tests.
use std::sync::Arc;

use egret_proxy::discovery::BrokerDiscoveryProvider;
use egret_proxy::{ProxyConfig, ProxyService, StaticDiscovery};

/// Open every egress dimension toward loopback, where the stub brokers
/// live.
pub fn allow_loopback_egress(config: &mut ProxyConfig) {
    config.broker_proxy_allowed_host_names = "*".to_string();
    config.broker_proxy_allowed_ip_addresses = "127.0.0.0/8,::1".to_string();
    config.broker_proxy_allowed_target_ports = "1-65535".to_string();
}

pub fn static_discovery(urls: &[&str]) -> Arc<dyn BrokerDiscoveryProvider> {
    Arc::new(StaticDiscovery::new(
        urls.iter().map(|url| url.parse().expect("broker url")).collect(),
    ))
}

pub async fn start_proxy(service: ProxyService) -> Arc<ProxyService> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let service = Arc::new(service);
    service.start().await.expect("start proxy");
    service
}

pub async fn start_default_proxy(
    config: ProxyConfig,
    discovery: Option<Arc<dyn BrokerDiscoveryProvider>>,
) -> Arc<ProxyService> {
    let service = ProxyService::new(config).expect("proxy service");
    let service = match discovery {
        Some(discovery) => service.with_discovery(discovery),
        None => service,
    };
    start_proxy(service).await
}
