// Egret proxy: client-facing front door for an egret pub/sub cluster.
//
// Clients speak the same length-prefixed binary protocol to the proxy that
// they would speak to a broker. The proxy authenticates them, answers
// control-plane lookups itself (forwarding to a broker picked by the
// discovery provider), and switches a connection into splice mode on the
// first data-plane command, after which it forwards opaque bytes between the
// client and the owning broker.
pub mod admission;
pub mod auth;
pub mod config;
pub mod connection;
pub mod direct;
pub mod discovery;
pub mod dns;
pub mod egress;
pub mod lookup;
pub mod observability;
pub mod service;
pub mod stats;
pub mod tls;

pub use admission::{AdmissionOutcome, ConnectionController, ConnectionPermit};
pub use auth::{
    AllowAllAuthorization, AuthOutcome, AuthenticationProvider, AuthenticationService,
    AuthorizationProvider, TokenAuthentication,
};
pub use config::ProxyConfig;
pub use discovery::{BrokerDiscoveryProvider, ControlPlaneDiscovery, StaticDiscovery};
pub use dns::{CachingResolver, DnsResolver};
pub use egress::{BrokerProxyValidator, EgressError};
pub use service::{ProxyExtension, ProxyService, StartupError};
pub use stats::TopicStatsRegistry;
