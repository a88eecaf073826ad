// Shared fixtures for proxy integration tests: an in-process stub broker,
// a minimal binary-protocol client, and TLS material helpers.
pub mod client;
pub mod stub_broker;
pub mod tls;

use anyhow::Result;
use async_trait::async_trait;

use egret_proxy::auth::AuthorizationProvider;
use egret_wire::TopicName;

/// Authorizer that denies everything; used to exercise the
/// `AuthorizationError` path.
pub struct DenyAllAuthorization;

#[async_trait]
impl AuthorizationProvider for DenyAllAuthorization {
    async fn can_lookup(&self, _principal: &str, _topic: &TopicName) -> Result<bool> {
        Ok(false)
    }
}
