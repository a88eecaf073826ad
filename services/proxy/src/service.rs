// Proxy service lifecycle: wires the shared components, binds listeners,
// and tears everything down in order on shutdown.
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::admission::{AdmissionOutcome, ConnectionController, ConnectionPermit};
use crate::auth::{
    AllowAllAuthorization, AuthenticationProvider, AuthenticationService, AuthorizationProvider,
    TokenAuthentication,
};
use crate::config::ProxyConfig;
use crate::connection::serve_connection;
use crate::direct::{ProxyIo, SpliceRate};
use crate::discovery::{BrokerDiscoveryProvider, ControlPlaneDiscovery};
use crate::dns::{CachingResolver, DnsResolver};
use crate::egress::BrokerProxyValidator;
use crate::stats::{STATS_ROLLUP_INTERVAL, TopicStatsRegistry};
use crate::tls;

/// Startup failures map onto distinct process exit codes: configuration and
/// bind problems are `1`, an unreachable control plane when one is required
/// is `2`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[source] anyhow::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("control plane unreachable: {0}")]
    MetadataUnreachable(#[source] anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::MetadataUnreachable(_) => 2,
            _ => 1,
        }
    }
}

/// Additional listener hook. Extensions are started after the proxy's own
/// listeners and aborted at shutdown.
pub trait ProxyExtension: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self, service: &Arc<ProxyService>) -> anyhow::Result<JoinHandle<()>>;
}

/// Advertised URLs clients are redirected to by rewritten lookup replies.
#[derive(Debug, Clone, Default)]
pub struct ServiceUrls {
    pub service_url: Option<String>,
    pub service_url_tls: Option<String>,
}

pub struct ProxyService {
    config: ProxyConfig,
    auth: AuthenticationService,
    authorization: Option<Arc<dyn AuthorizationProvider>>,
    discovery: Mutex<Option<Arc<dyn BrokerDiscoveryProvider>>>,
    extensions: Mutex<Vec<Arc<dyn ProxyExtension>>>,
    resolver: Arc<dyn DnsResolver>,
    validator: BrokerProxyValidator,
    controller: Arc<ConnectionController>,
    lookup_permits: Arc<tokio::sync::Semaphore>,
    topic_stats: Arc<TopicStatsRegistry>,
    connections: DashMap<u64, Option<Arc<SpliceRate>>>,
    next_connection_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    urls: Mutex<ServiceUrls>,
    listen_addr: Mutex<Option<SocketAddr>>,
    listen_addr_tls: Mutex<Option<SocketAddr>>,
    backend_connector: Mutex<Option<TlsConnector>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyService {
    /// Wire the default component set from configuration. Providers can be
    /// swapped with the `with_*` builders before `start`.
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let resolver: Arc<dyn DnsResolver> = Arc::new(CachingResolver::new());
        let validator = BrokerProxyValidator::from_config(
            &config.broker_proxy_allowed_host_names,
            &config.broker_proxy_allowed_ip_addresses,
            &config.broker_proxy_allowed_target_ports,
            Arc::clone(&resolver),
        )?;
        let auth = if config.authentication_enabled {
            let mut providers: Vec<Arc<dyn AuthenticationProvider>> = Vec::new();
            if let Some(path) = &config.auth_token_file {
                providers.push(Arc::new(TokenAuthentication::from_file(path)?));
            }
            AuthenticationService::new(providers)
        } else {
            AuthenticationService::disabled()
        };
        let authorization: Option<Arc<dyn AuthorizationProvider>> = if config.authorization_enabled
        {
            Some(Arc::new(AllowAllAuthorization))
        } else {
            None
        };
        let controller = Arc::new(ConnectionController::new(
            config.max_concurrent_inbound_connections,
            config.max_concurrent_inbound_connections_per_ip,
        ));
        let lookup_permits = Arc::new(tokio::sync::Semaphore::new(
            config.max_concurrent_lookup_requests,
        ));
        let topic_stats = Arc::new(TopicStatsRegistry::new(config.topic_stats_max_entries));
        let (shutdown_tx, _) = watch::channel(false);
        let urls = initial_urls(&config);
        Ok(Self {
            config,
            auth,
            authorization,
            discovery: Mutex::new(None),
            extensions: Mutex::new(Vec::new()),
            resolver,
            validator,
            controller,
            lookup_permits,
            topic_stats,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(0),
            shutdown_tx,
            urls: Mutex::new(urls),
            listen_addr: Mutex::new(None),
            listen_addr_tls: Mutex::new(None),
            backend_connector: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_discovery(self, provider: Arc<dyn BrokerDiscoveryProvider>) -> Self {
        *self.discovery.lock().expect("discovery lock") = Some(provider);
        self
    }

    pub fn with_authentication(mut self, providers: Vec<Arc<dyn AuthenticationProvider>>) -> Self {
        self.auth = AuthenticationService::new(providers);
        self
    }

    pub fn with_authorization(mut self, provider: Arc<dyn AuthorizationProvider>) -> Self {
        self.authorization = Some(provider);
        self
    }

    pub fn with_extension(self, extension: Arc<dyn ProxyExtension>) -> Self {
        self.extensions.lock().expect("extensions lock").push(extension);
        self
    }

    /// Bind listeners and start serving. Returns once listeners are live.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartupError> {
        self.config.validate().map_err(StartupError::InvalidConfig)?;

        // Control-plane discovery is only wired when nothing was injected.
        if self.discovery().is_none()
            && let Some(url) = &self.config.control_plane_url
        {
            let discovery = ControlPlaneDiscovery::new(url.clone());
            discovery
                .prime()
                .await
                .map_err(StartupError::MetadataUnreachable)?;
            let sync = discovery.spawn_sync(Duration::from_millis(
                self.config.control_plane_sync_interval_ms,
            ));
            self.tasks.lock().expect("tasks lock").push(sync);
            *self.discovery.lock().expect("discovery lock") = Some(discovery);
        }

        if let Some(port) = self.config.service_port {
            let listener = self.bind(port).await?;
            let addr = listener.local_addr().map_err(|source| StartupError::Bind {
                addr: format!("{}:{port}", self.config.bind_address),
                source,
            })?;
            *self.listen_addr.lock().expect("addr lock") = Some(addr);
            self.spawn_acceptors(Arc::new(listener), None);
            tracing::info!(%addr, "started proxy listener");
        }

        if let Some(port) = self.config.service_port_tls {
            let tls_config = tls::build_server_config(
                self.config
                    .tls_cert_path
                    .as_deref()
                    .expect("validated tls cert path"),
                self.config
                    .tls_key_path
                    .as_deref()
                    .expect("validated tls key path"),
            )
            .map_err(StartupError::InvalidConfig)?;
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            let listener = self.bind(port).await?;
            let addr = listener.local_addr().map_err(|source| StartupError::Bind {
                addr: format!("{}:{port}", self.config.bind_address),
                source,
            })?;
            *self.listen_addr_tls.lock().expect("addr lock") = Some(addr);
            self.spawn_acceptors(Arc::new(listener), Some(acceptor));
            tracing::info!(%addr, "started proxy TLS listener");
        }

        *self.urls.lock().expect("urls lock") = self.advertised_urls();

        // 60 s schedule shared by topic stats and splice rate samplers.
        let service = Arc::clone(self);
        let rollup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_ROLLUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.topic_stats.rollup();
                for entry in service.connections.iter() {
                    if let Some(rate) = entry.value() {
                        rate.calculate();
                    }
                }
            }
        });
        self.tasks.lock().expect("tasks lock").push(rollup);

        let extensions: Vec<Arc<dyn ProxyExtension>> =
            self.extensions.lock().expect("extensions lock").clone();
        for extension in extensions {
            match extension.start(self) {
                Ok(handle) => {
                    tracing::info!(extension = extension.name(), "started proxy extension");
                    self.tasks.lock().expect("tasks lock").push(handle);
                }
                Err(err) => {
                    return Err(StartupError::InvalidConfig(
                        err.context(format!("start extension {}", extension.name())),
                    ));
                }
            }
        }

        Ok(())
    }

    async fn bind(&self, port: u16) -> Result<TcpListener, StartupError> {
        let addr = format!("{}:{port}", self.config.bind_address);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })
    }

    fn spawn_acceptors(self: &Arc<Self>, listener: Arc<TcpListener>, tls: Option<TlsAcceptor>) {
        let mut tasks = self.tasks.lock().expect("tasks lock");
        for _ in 0..self.config.num_acceptor_threads.max(1) {
            let service = Arc::clone(self);
            let listener = Arc::clone(&listener);
            let tls = tls.clone();
            tasks.push(tokio::spawn(async move {
                service.accept_loop(listener, tls).await;
            }));
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<TcpListener>, tls: Option<TlsAcceptor>) {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let permit = match self.controller.try_admit(peer.ip()) {
                AdmissionOutcome::Admitted(permit) => permit,
                outcome @ (AdmissionOutcome::RejectedGlobal | AdmissionOutcome::RejectedPerIp) => {
                    metrics::counter!("pulsar_proxy_rejected_connections").increment(1);
                    tracing::debug!(peer = %peer, ?outcome, "connection rejected");
                    // No frame is written; the client just sees the close.
                    drop(socket);
                    continue;
                }
            };
            metrics::counter!("pulsar_proxy_new_connections").increment(1);
            socket.set_nodelay(true).ok();
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let service = Arc::clone(&self);
            let tls = tls.clone();
            tokio::spawn(async move {
                let via_tls = tls.is_some();
                let io: ProxyIo = match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => Box::new(stream),
                        Err(err) => {
                            tracing::info!(connection = id, peer = %peer, error = %err,
                                "TLS handshake failed");
                            drop(permit);
                            return;
                        }
                    },
                    None => Box::new(socket),
                };
                serve_connection(service, io, peer, id, permit, via_tls).await;
            });
        }
    }

    /// Stop accepting, close every live connection, wait for the drain,
    /// then stop background work. Stages run in order even when one lags.
    pub async fn shutdown(&self) {
        tracing::info!(
            connections = self.connections.len(),
            "shutting down proxy service"
        );
        // Stop accepting and stop background schedules.
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        // Ask every connection to close on its own task.
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_drain_timeout_ms);
        while !self.connections.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.connections.len();
        if remaining > 0 {
            tracing::warn!(remaining, "drain deadline expired; abandoning connections");
        }
        *self.discovery.lock().expect("discovery lock") = None;
        tracing::info!("proxy service closed");
    }

    // Accessors used by the connection machinery.

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthenticationService {
        &self.auth
    }

    pub fn authorization(&self) -> Option<Arc<dyn AuthorizationProvider>> {
        self.authorization.clone()
    }

    pub fn discovery(&self) -> Option<Arc<dyn BrokerDiscoveryProvider>> {
        self.discovery.lock().expect("discovery lock").clone()
    }

    pub fn resolver(&self) -> &Arc<dyn DnsResolver> {
        &self.resolver
    }

    pub fn validator(&self) -> &BrokerProxyValidator {
        &self.validator
    }

    pub fn lookup_permits(&self) -> &Arc<tokio::sync::Semaphore> {
        &self.lookup_permits
    }

    pub fn topic_stats(&self) -> Arc<TopicStatsRegistry> {
        Arc::clone(&self.topic_stats)
    }

    pub fn active_connections(&self) -> usize {
        self.controller.active()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn service_urls(&self) -> ServiceUrls {
        self.urls.lock().expect("urls lock").clone()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().expect("addr lock")
    }

    pub fn listen_addr_tls(&self) -> Option<SocketAddr> {
        *self.listen_addr_tls.lock().expect("addr lock")
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Lazily built TLS connector for backend connections.
    pub fn backend_connector(&self) -> anyhow::Result<TlsConnector> {
        let mut slot = self.backend_connector.lock().expect("connector lock");
        if let Some(connector) = slot.as_ref() {
            return Ok(connector.clone());
        }
        let connector = tls::build_backend_connector(
            self.config.tls_trust_store_path.as_deref(),
            self.config.tls_hostname_verification,
        )?;
        *slot = Some(connector.clone());
        Ok(connector)
    }

    pub(crate) fn register_connection(
        self: &Arc<Self>,
        id: u64,
        permit: ConnectionPermit,
    ) -> ConnectionGuard {
        self.connections.insert(id, None);
        ConnectionGuard {
            service: Arc::clone(self),
            id,
            _permit: permit,
        }
    }

    pub(crate) fn register_splice_rate(&self, id: u64, rate: Arc<SpliceRate>) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            *entry = Some(rate);
        }
    }

    fn advertised_host(&self) -> String {
        self.config
            .advertised_address
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| self.config.bind_address.clone())
    }

    fn advertised_urls(&self) -> ServiceUrls {
        let host = self.advertised_host();
        ServiceUrls {
            service_url: self
                .listen_addr()
                .map(|addr| format!("pulsar://{host}:{}", addr.port())),
            service_url_tls: self
                .listen_addr_tls()
                .map(|addr| format!("pulsar+ssl://{host}:{}", addr.port())),
        }
    }
}

fn initial_urls(config: &ProxyConfig) -> ServiceUrls {
    let host = config
        .advertised_address
        .clone()
        .unwrap_or_else(|| config.bind_address.clone());
    ServiceUrls {
        service_url: config
            .service_port
            .map(|port| format!("pulsar://{host}:{port}")),
        service_url_tls: config
            .service_port_tls
            .map(|port| format!("pulsar+ssl://{host}:{port}")),
    }
}

/// Registration token for one live connection: removes the connection from
/// the live set and releases its admission slot, even on unwind.
pub(crate) struct ConnectionGuard {
    service: Arc<ProxyService>,
    id: u64,
    _permit: ConnectionPermit,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.service.connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_error_exit_codes() {
        let config_err = StartupError::InvalidConfig(anyhow::anyhow!("bad"));
        assert_eq!(config_err.exit_code(), 1);
        let bind_err = StartupError::Bind {
            addr: "0.0.0.0:6650".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(bind_err.exit_code(), 1);
        let md_err = StartupError::MetadataUnreachable(anyhow::anyhow!("down"));
        assert_eq!(md_err.exit_code(), 2);
    }

    #[test]
    fn initial_urls_follow_config() {
        let mut config = ProxyConfig::for_tests();
        config.service_port = Some(6650);
        config.service_port_tls = Some(6651);
        config.advertised_address = Some("proxy.example".to_string());
        let urls = initial_urls(&config);
        assert_eq!(urls.service_url.as_deref(), Some("pulsar://proxy.example:6650"));
        assert_eq!(
            urls.service_url_tls.as_deref(),
            Some("pulsar+ssl://proxy.example:6651")
        );
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_shuts_down() {
        let service = Arc::new(ProxyService::new(ProxyConfig::for_tests()).expect("service"));
        service.start().await.expect("start");
        let addr = service.listen_addr().expect("addr");
        assert_ne!(addr.port(), 0);
        let urls = service.service_urls();
        assert!(urls.service_url.expect("url").contains(&addr.port().to_string()));
        // A client can reach the listener.
        let _client = tokio::net::TcpStream::connect(addr).await.expect("connect");
        service.shutdown().await;
        assert_eq!(service.connection_count(), 0);
    }

    #[tokio::test]
    async fn closing_an_already_closed_service_is_a_noop() {
        let service = Arc::new(ProxyService::new(ProxyConfig::for_tests()).expect("service"));
        service.start().await.expect("start");
        service.shutdown().await;
        service.shutdown().await;
    }
}
