use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;

use egret_wire::DEFAULT_MAX_FRAME_BYTES;

// Proxy configuration sourced from environment variables with an optional
// YAML override file (EGRET_PROXY_CONFIG). YAML keys use the camelCase
// option names recognised by the rest of the cluster tooling.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Address the service listeners bind to.
    pub bind_address: String,
    // Plaintext listener port; None disables the plaintext listener.
    pub service_port: Option<u16>,
    // TLS listener port; None disables the TLS listener.
    pub service_port_tls: Option<u16>,
    // Prometheus/health HTTP listener.
    pub metrics_bind: SocketAddr,
    // Hostname advertised in rewritten lookup replies. Falls back to the
    // machine hostname, then to the bind address.
    pub advertised_address: Option<String>,
    // Cluster label attached to every metric.
    pub cluster_name: String,
    // Admission caps. Zero rejects every connection.
    pub max_concurrent_inbound_connections: usize,
    pub max_concurrent_inbound_connections_per_ip: usize,
    // Global cap on in-flight lookup requests.
    pub max_concurrent_lookup_requests: usize,
    // Per-lookup RPC deadline.
    pub lookup_request_timeout_ms: u64,
    // Client-facing keep-alive; 0 disables pings.
    pub keep_alive_interval_seconds: u64,
    // Idle-connection timeout; 0 disables.
    pub idle_timeout_seconds: u64,
    // Max frame accepted from clients and brokers.
    pub max_frame_bytes: usize,
    // Frames buffered while the backend connect/TLS handshake completes.
    // Overflow closes the connection.
    pub pending_queue_max_frames: usize,
    // Graceful shutdown drain deadline.
    pub shutdown_drain_timeout_ms: u64,
    // Cap on distinct topics tracked by the stats registry.
    pub topic_stats_max_entries: usize,
    // Accept tasks per listener.
    pub num_acceptor_threads: usize,
    // Runtime worker threads; 0 uses the runtime default.
    pub num_io_threads: usize,
    // 0 = off, 1 = connect/disconnect, 2 = every frame.
    pub proxy_log_level: u8,
    // Honoured only where the OS exposes a kernel splice primitive.
    pub proxy_zero_copy_mode_enabled: bool,
    // Egress allow-lists, comma separated. Empty means deny all.
    pub broker_proxy_allowed_host_names: String,
    pub broker_proxy_allowed_ip_addresses: String,
    pub broker_proxy_allowed_target_ports: String,
    // TLS material for the TLS listener.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    // Trust store for backend TLS connections.
    pub tls_trust_store_path: Option<PathBuf>,
    pub tls_hostname_verification: bool,
    // Client authentication/authorization toggles.
    pub authentication_enabled: bool,
    pub authorization_enabled: bool,
    // Token map (YAML: token -> principal) for the built-in token provider.
    pub auth_token_file: Option<PathBuf>,
    // Credential the proxy presents to brokers.
    pub broker_client_auth_token: Option<String>,
    // Control-plane discovery endpoint; None means discovery must be
    // injected programmatically.
    pub control_plane_url: Option<String>,
    pub control_plane_sync_interval_ms: u64,
}

const DEFAULT_SERVICE_PORT: u16 = 6650;
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_CLUSTER_NAME: &str = "standalone";
const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 10_000;
const DEFAULT_MAX_INBOUND_CONNECTIONS_PER_IP: usize = 10_000;
const DEFAULT_MAX_LOOKUP_REQUESTS: usize = 50_000;
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_KEEP_ALIVE_SECONDS: u64 = 30;
const DEFAULT_PENDING_QUEUE_MAX_FRAMES: usize = 256;
const DEFAULT_SHUTDOWN_DRAIN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TOPIC_STATS_MAX_ENTRIES: usize = 10_000;
const DEFAULT_CONTROL_PLANE_SYNC_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProxyConfigOverride {
    bind_address: Option<String>,
    service_port: Option<u16>,
    service_port_tls: Option<u16>,
    metrics_bind: Option<String>,
    advertised_address: Option<String>,
    cluster_name: Option<String>,
    max_concurrent_inbound_connections: Option<usize>,
    max_concurrent_inbound_connections_per_ip: Option<usize>,
    max_concurrent_lookup_requests: Option<usize>,
    lookup_request_timeout_ms: Option<u64>,
    keep_alive_interval_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    max_frame_bytes: Option<usize>,
    pending_queue_max_frames: Option<usize>,
    shutdown_drain_timeout_ms: Option<u64>,
    topic_stats_max_entries: Option<usize>,
    num_acceptor_threads: Option<usize>,
    num_io_threads: Option<usize>,
    proxy_log_level: Option<u8>,
    proxy_zero_copy_mode_enabled: Option<bool>,
    broker_proxy_allowed_host_names: Option<String>,
    broker_proxy_allowed_ip_addresses: Option<String>,
    broker_proxy_allowed_target_ports: Option<String>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    tls_trust_store_path: Option<PathBuf>,
    tls_hostname_verification: Option<bool>,
    authentication_enabled: Option<bool>,
    authorization_enabled: Option<bool>,
    auth_token_file: Option<PathBuf>,
    broker_client_auth_token: Option<String>,
    control_plane_url: Option<String>,
    control_plane_sync_interval_ms: Option<u64>,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse::<T>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "TRUE" | "YES"))
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = env_string("EGRET_PROXY_METRICS_BIND")
            .unwrap_or_else(|| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .context("parse EGRET_PROXY_METRICS_BIND")?;
        Ok(Self {
            bind_address: env_string("EGRET_PROXY_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            service_port: Some(
                env_parse("EGRET_PROXY_SERVICE_PORT").unwrap_or(DEFAULT_SERVICE_PORT),
            ),
            service_port_tls: env_parse("EGRET_PROXY_SERVICE_PORT_TLS"),
            metrics_bind,
            advertised_address: env_string("EGRET_PROXY_ADVERTISED_ADDRESS"),
            cluster_name: env_string("EGRET_PROXY_CLUSTER_NAME")
                .unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_string()),
            max_concurrent_inbound_connections: env_parse("EGRET_PROXY_MAX_INBOUND_CONNECTIONS")
                .unwrap_or(DEFAULT_MAX_INBOUND_CONNECTIONS),
            max_concurrent_inbound_connections_per_ip: env_parse(
                "EGRET_PROXY_MAX_INBOUND_CONNECTIONS_PER_IP",
            )
            .unwrap_or(DEFAULT_MAX_INBOUND_CONNECTIONS_PER_IP),
            max_concurrent_lookup_requests: env_parse("EGRET_PROXY_MAX_LOOKUP_REQUESTS")
                .unwrap_or(DEFAULT_MAX_LOOKUP_REQUESTS),
            lookup_request_timeout_ms: env_parse("EGRET_PROXY_LOOKUP_TIMEOUT_MS")
                .unwrap_or(DEFAULT_LOOKUP_TIMEOUT_MS),
            keep_alive_interval_seconds: env_parse("EGRET_PROXY_KEEP_ALIVE_SECONDS")
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECONDS),
            idle_timeout_seconds: env_parse("EGRET_PROXY_IDLE_TIMEOUT_SECONDS").unwrap_or(0),
            max_frame_bytes: env_parse("EGRET_PROXY_MAX_FRAME_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            pending_queue_max_frames: env_parse("EGRET_PROXY_PENDING_QUEUE_MAX_FRAMES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_PENDING_QUEUE_MAX_FRAMES),
            shutdown_drain_timeout_ms: env_parse("EGRET_PROXY_SHUTDOWN_DRAIN_TIMEOUT_MS")
                .unwrap_or(DEFAULT_SHUTDOWN_DRAIN_TIMEOUT_MS),
            topic_stats_max_entries: env_parse("EGRET_PROXY_TOPIC_STATS_MAX_ENTRIES")
                .unwrap_or(DEFAULT_TOPIC_STATS_MAX_ENTRIES),
            num_acceptor_threads: env_parse("EGRET_PROXY_NUM_ACCEPTOR_THREADS")
                .filter(|value| *value > 0)
                .unwrap_or(1),
            num_io_threads: env_parse("EGRET_PROXY_NUM_IO_THREADS").unwrap_or(0),
            proxy_log_level: env_parse("EGRET_PROXY_LOG_LEVEL").unwrap_or(0),
            proxy_zero_copy_mode_enabled: env_bool("EGRET_PROXY_ZERO_COPY_MODE")
                .unwrap_or(false),
            broker_proxy_allowed_host_names: env_string("EGRET_PROXY_ALLOWED_HOST_NAMES")
                .unwrap_or_default(),
            broker_proxy_allowed_ip_addresses: env_string("EGRET_PROXY_ALLOWED_IP_ADDRESSES")
                .unwrap_or_default(),
            broker_proxy_allowed_target_ports: env_string("EGRET_PROXY_ALLOWED_TARGET_PORTS")
                .unwrap_or_default(),
            tls_cert_path: env_string("EGRET_PROXY_TLS_CERT").map(PathBuf::from),
            tls_key_path: env_string("EGRET_PROXY_TLS_KEY").map(PathBuf::from),
            tls_trust_store_path: env_string("EGRET_PROXY_TLS_TRUST_STORE").map(PathBuf::from),
            tls_hostname_verification: env_bool("EGRET_PROXY_TLS_HOSTNAME_VERIFICATION")
                .unwrap_or(true),
            authentication_enabled: env_bool("EGRET_PROXY_AUTHENTICATION_ENABLED")
                .unwrap_or(false),
            authorization_enabled: env_bool("EGRET_PROXY_AUTHORIZATION_ENABLED").unwrap_or(false),
            auth_token_file: env_string("EGRET_PROXY_AUTH_TOKEN_FILE").map(PathBuf::from),
            broker_client_auth_token: env_string("EGRET_PROXY_BROKER_CLIENT_AUTH_TOKEN"),
            control_plane_url: env_string("EGRET_PROXY_CONTROL_PLANE_URL"),
            control_plane_sync_interval_ms: env_parse("EGRET_PROXY_CONTROL_PLANE_SYNC_INTERVAL_MS")
                .unwrap_or(DEFAULT_CONTROL_PLANE_SYNC_INTERVAL_MS),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let Some(path) = env_string("EGRET_PROXY_CONFIG") else {
            return Ok(config);
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(err).with_context(|| format!("read EGRET_PROXY_CONFIG: {path}"));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read proxy config: {path}"));
            }
        };
        let overrides: ProxyConfigOverride =
            serde_yaml::from_str(&contents).context("parse proxy config yaml")?;
        config.apply(overrides)?;
        Ok(config)
    }

    fn apply(&mut self, overrides: ProxyConfigOverride) -> Result<()> {
        if let Some(value) = overrides.bind_address {
            self.bind_address = value;
        }
        if let Some(value) = overrides.service_port {
            self.service_port = Some(value);
        }
        if let Some(value) = overrides.service_port_tls {
            self.service_port_tls = Some(value);
        }
        if let Some(value) = overrides.metrics_bind {
            self.metrics_bind = value.parse().context("parse metricsBind")?;
        }
        if let Some(value) = overrides.advertised_address {
            self.advertised_address = Some(value);
        }
        if let Some(value) = overrides.cluster_name {
            self.cluster_name = value;
        }
        if let Some(value) = overrides.max_concurrent_inbound_connections {
            self.max_concurrent_inbound_connections = value;
        }
        if let Some(value) = overrides.max_concurrent_inbound_connections_per_ip {
            self.max_concurrent_inbound_connections_per_ip = value;
        }
        if let Some(value) = overrides.max_concurrent_lookup_requests {
            self.max_concurrent_lookup_requests = value;
        }
        if let Some(value) = overrides.lookup_request_timeout_ms {
            self.lookup_request_timeout_ms = value;
        }
        if let Some(value) = overrides.keep_alive_interval_seconds {
            self.keep_alive_interval_seconds = value;
        }
        if let Some(value) = overrides.idle_timeout_seconds {
            self.idle_timeout_seconds = value;
        }
        if let Some(value) = overrides.max_frame_bytes
            && value > 0
        {
            self.max_frame_bytes = value;
        }
        if let Some(value) = overrides.pending_queue_max_frames
            && value > 0
        {
            self.pending_queue_max_frames = value;
        }
        if let Some(value) = overrides.shutdown_drain_timeout_ms {
            self.shutdown_drain_timeout_ms = value;
        }
        if let Some(value) = overrides.topic_stats_max_entries {
            self.topic_stats_max_entries = value;
        }
        if let Some(value) = overrides.num_acceptor_threads
            && value > 0
        {
            self.num_acceptor_threads = value;
        }
        if let Some(value) = overrides.num_io_threads {
            self.num_io_threads = value;
        }
        if let Some(value) = overrides.proxy_log_level {
            self.proxy_log_level = value;
        }
        if let Some(value) = overrides.proxy_zero_copy_mode_enabled {
            self.proxy_zero_copy_mode_enabled = value;
        }
        if let Some(value) = overrides.broker_proxy_allowed_host_names {
            self.broker_proxy_allowed_host_names = value;
        }
        if let Some(value) = overrides.broker_proxy_allowed_ip_addresses {
            self.broker_proxy_allowed_ip_addresses = value;
        }
        if let Some(value) = overrides.broker_proxy_allowed_target_ports {
            self.broker_proxy_allowed_target_ports = value;
        }
        if let Some(value) = overrides.tls_cert_path {
            self.tls_cert_path = Some(value);
        }
        if let Some(value) = overrides.tls_key_path {
            self.tls_key_path = Some(value);
        }
        if let Some(value) = overrides.tls_trust_store_path {
            self.tls_trust_store_path = Some(value);
        }
        if let Some(value) = overrides.tls_hostname_verification {
            self.tls_hostname_verification = value;
        }
        if let Some(value) = overrides.authentication_enabled {
            self.authentication_enabled = value;
        }
        if let Some(value) = overrides.authorization_enabled {
            self.authorization_enabled = value;
        }
        if let Some(value) = overrides.auth_token_file {
            self.auth_token_file = Some(value);
        }
        if let Some(value) = overrides.broker_client_auth_token {
            self.broker_client_auth_token = Some(value);
        }
        if let Some(value) = overrides.control_plane_url {
            self.control_plane_url = Some(value);
        }
        if let Some(value) = overrides.control_plane_sync_interval_ms {
            self.control_plane_sync_interval_ms = value;
        }
        Ok(())
    }

    /// Startup-time validation of cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.authorization_enabled && !self.authentication_enabled {
            bail!(
                "invalid proxy configuration: authorizationEnabled requires \
                 authenticationEnabled"
            );
        }
        if self.service_port_tls.is_some()
            && (self.tls_cert_path.is_none() || self.tls_key_path.is_none())
        {
            bail!("servicePortTls is set but tlsCertPath/tlsKeyPath are missing");
        }
        if self.service_port.is_none() && self.service_port_tls.is_none() {
            bail!("no listener configured: set servicePort and/or servicePortTls");
        }
        Ok(())
    }

    /// Test-friendly defaults: loopback, ephemeral ports, no auth.
    pub fn for_tests() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            service_port: Some(0),
            service_port_tls: None,
            metrics_bind: "127.0.0.1:0".parse().expect("addr"),
            advertised_address: Some("127.0.0.1".to_string()),
            cluster_name: "test".to_string(),
            max_concurrent_inbound_connections: DEFAULT_MAX_INBOUND_CONNECTIONS,
            max_concurrent_inbound_connections_per_ip: DEFAULT_MAX_INBOUND_CONNECTIONS_PER_IP,
            max_concurrent_lookup_requests: DEFAULT_MAX_LOOKUP_REQUESTS,
            lookup_request_timeout_ms: 2_000,
            keep_alive_interval_seconds: 0,
            idle_timeout_seconds: 0,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            pending_queue_max_frames: DEFAULT_PENDING_QUEUE_MAX_FRAMES,
            shutdown_drain_timeout_ms: 2_000,
            topic_stats_max_entries: DEFAULT_TOPIC_STATS_MAX_ENTRIES,
            num_acceptor_threads: 1,
            num_io_threads: 0,
            proxy_log_level: 0,
            proxy_zero_copy_mode_enabled: false,
            broker_proxy_allowed_host_names: String::new(),
            broker_proxy_allowed_ip_addresses: String::new(),
            broker_proxy_allowed_target_ports: String::new(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_trust_store_path: None,
            tls_hostname_verification: true,
            authentication_enabled: false,
            authorization_enabled: false,
            auth_token_file: None,
            broker_client_auth_token: None,
            control_plane_url: None,
            control_plane_sync_interval_ms: DEFAULT_CONTROL_PLANE_SYNC_INTERVAL_MS,
        }
    }
}
