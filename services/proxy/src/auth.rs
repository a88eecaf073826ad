// Client authentication/authorization provider seams. Real deployments
// plug in their own providers; the built-ins cover token files and tests.
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use egret_wire::TopicName;

/// Authentication failures are deliberately opaque: the client learns that
/// authentication failed, never whether the principal exists.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed")]
    Failed,
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),
}

/// One authentication step. Providers that need a round trip return
/// `Challenge`; the connection forwards it as an `AuthChallenge` frame and
/// feeds the client's `AuthResponse` back into `authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted { principal: String },
    Challenge { challenge: String },
}

#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    fn method_name(&self) -> &str;
    async fn authenticate(&self, auth_data: &str) -> Result<AuthOutcome, AuthError>;
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Whether `principal` may look up (and ultimately connect to) `topic`.
    async fn can_lookup(&self, principal: &str, topic: &TopicName) -> Result<bool>;
}

/// Registry of authentication providers keyed by method name.
pub struct AuthenticationService {
    enabled: bool,
    providers: HashMap<String, Arc<dyn AuthenticationProvider>>,
}

impl AuthenticationService {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            providers: HashMap::new(),
        }
    }

    pub fn new(providers: Vec<Arc<dyn AuthenticationProvider>>) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| (provider.method_name().to_string(), provider))
            .collect();
        Self {
            enabled: true,
            providers,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn authenticate(
        &self,
        method: Option<&str>,
        auth_data: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        let method = method.unwrap_or_default();
        let provider = self
            .providers
            .get(method)
            .ok_or_else(|| AuthError::UnsupportedMethod(method.to_string()))?;
        provider.authenticate(auth_data.unwrap_or_default()).await
    }
}

/// Static token map: token value -> principal name.
pub struct TokenAuthentication {
    tokens: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    tokens: HashMap<String, String>,
}

impl TokenAuthentication {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read auth token file: {}", path.display()))?;
        let parsed: TokenFile =
            serde_yaml::from_str(&contents).context("parse auth token file yaml")?;
        Ok(Self::new(parsed.tokens))
    }
}

#[async_trait]
impl AuthenticationProvider for TokenAuthentication {
    fn method_name(&self) -> &str {
        "token"
    }

    async fn authenticate(&self, auth_data: &str) -> Result<AuthOutcome, AuthError> {
        match self.tokens.get(auth_data) {
            Some(principal) => Ok(AuthOutcome::Granted {
                principal: principal.clone(),
            }),
            None => Err(AuthError::Failed),
        }
    }
}

/// Default authorizer when authorization is enabled without a provider of
/// its own: every authenticated principal may look up every topic.
pub struct AllowAllAuthorization;

#[async_trait]
impl AuthorizationProvider for AllowAllAuthorization {
    async fn can_lookup(&self, _principal: &str, _topic: &TopicName) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_service() -> AuthenticationService {
        let provider = TokenAuthentication::new(HashMap::from([(
            "secret-1".to_string(),
            "svc-orders".to_string(),
        )]));
        AuthenticationService::new(vec![Arc::new(provider)])
    }

    #[tokio::test]
    async fn token_grants_mapped_principal() {
        let service = token_service();
        let outcome = service
            .authenticate(Some("token"), Some("secret-1"))
            .await
            .expect("auth");
        assert_eq!(
            outcome,
            AuthOutcome::Granted {
                principal: "svc-orders".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unknown_token_fails_without_detail() {
        let service = token_service();
        let err = service
            .authenticate(Some("token"), Some("wrong"))
            .await
            .expect_err("reject");
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let service = token_service();
        let err = service
            .authenticate(Some("kerberos"), Some("x"))
            .await
            .expect_err("reject");
        assert!(matches!(err, AuthError::UnsupportedMethod(_)));
    }

    #[tokio::test]
    async fn allow_all_authorizer_allows() {
        let topic: TopicName = "persistent://t/n/x".parse().expect("topic");
        assert!(AllowAllAuthorization
            .can_lookup("anyone", &topic)
            .await
            .expect("authz"));
    }
}
