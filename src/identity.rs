//! Network identity used to scope discovery
//!
//! Peers behind the same public address find each other. A failed lookup
//! never aborts registration; it resolves to a fallback sentinel instead.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::IdentityConfig;
use crate::errors::SignalError;

/// Identity reported when no lookup succeeds.
pub const FALLBACK_IDENTITY: &str = "local-fallback-ip";

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn lookup(&self) -> Result<String, SignalError>;
}

/// Resolve an identity, substituting `fallback` when the lookup fails.
pub async fn resolve_identity(source: &dyn IdentitySource, fallback: &str) -> String {
    match source.lookup().await {
        Ok(identity) if !identity.trim().is_empty() => identity.trim().to_string(),
        Ok(_) => {
            log::warn!("Identity lookup returned nothing, using fallback {}", fallback);
            fallback.to_string()
        }
        Err(e) => {
            log::warn!("Identity lookup failed, using fallback {}: {}", fallback, e);
            fallback.to_string()
        }
    }
}

/// A fixed identity, for tests and deployments that know their scope.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl StaticIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }
}

#[async_trait]
impl IdentitySource for StaticIdentity {
    async fn lookup(&self) -> Result<String, SignalError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// Public IP lookup over HTTP (`{"ip": "..."}` responses).
#[derive(Debug, Clone)]
pub struct PublicIpLookup {
    url: String,
    timeout: Duration,
}

impl PublicIpLookup {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self::new(config.lookup_url.clone(), Duration::from_millis(config.timeout_ms))
    }

    fn fetch(url: &str, timeout: Duration) -> Result<String, SignalError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let response: IpResponse = agent
            .get(url)
            .call()
            .map_err(|e| SignalError::IdentityLookup(e.to_string()))?
            .into_json()
            .map_err(|e| SignalError::IdentityLookup(format!("unreadable response: {}", e)))?;
        Ok(response.ip)
    }
}

#[async_trait]
impl IdentitySource for PublicIpLookup {
    async fn lookup(&self) -> Result<String, SignalError> {
        let url = self.url.clone();
        let timeout = self.timeout;
        log::debug!("Looking up public identity via {}", url);
        tokio::task::spawn_blocking(move || Self::fetch(&url, timeout))
            .await
            .map_err(|e| SignalError::IdentityLookup(format!("lookup aborted: {}", e)))?
    }
}
