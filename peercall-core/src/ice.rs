//! ICE server provisioning
//!
//! Relay and reflexive servers come from an external provider, fetched once
//! per session start. A slow or failing provider never blocks a call: the
//! configured fallback list is used instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Public STUN server used when nothing else is configured
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE provisioning errors
#[derive(Error, Debug)]
pub enum IceConfigError {
    /// Provider could not produce a server list
    #[error("ICE server fetch failed: {0}")]
    FetchFailed(String),

    /// Provider returned no usable servers
    #[error("ICE server list is empty")]
    Empty,
}

/// A STUN or TURN server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// TURN credential
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServer {
    /// A STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// A TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }

    /// Whether every URL uses a known ICE scheme
    pub fn is_valid(&self) -> bool {
        !self.urls.is_empty()
            && self.urls.iter().all(|u| {
                u.starts_with("stun:") || u.starts_with("turn:") || u.starts_with("turns:")
            })
    }

    /// Whether this is a relay server
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Source of ICE servers for new sessions
///
/// Implement this for your credential service (e.g. a TURN REST endpoint).
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    /// Fetch the current server list
    async fn fetch(&self) -> Result<Vec<IceServer>, IceConfigError>;
}

/// Provider returning a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticIceServerProvider {
    servers: Vec<IceServer>,
}

impl StaticIceServerProvider {
    /// Create a provider for a fixed list
    #[must_use]
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServerProvider {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceConfigError> {
        Ok(self.servers.clone())
    }
}

/// The built-in fallback list
#[must_use]
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun(DEFAULT_STUN_URL)]
}

/// Fetch servers from `provider`, falling back on error, timeout or an
/// empty/invalid result
#[tracing::instrument(skip(provider, fallback))]
pub async fn resolve_ice_servers(
    provider: &dyn IceServerProvider,
    timeout: Duration,
    fallback: &[IceServer],
) -> Vec<IceServer> {
    let result = match tokio::time::timeout(timeout, provider.fetch()).await {
        Ok(Ok(servers)) => {
            let valid: Vec<IceServer> = servers.into_iter().filter(IceServer::is_valid).collect();
            if valid.is_empty() {
                Err(IceConfigError::Empty)
            } else {
                Ok(valid)
            }
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(IceConfigError::FetchFailed("timed out".to_string())),
    };

    match result {
        Ok(servers) => {
            tracing::debug!(count = servers.len(), "Using provisioned ICE servers");
            servers
        }
        Err(e) => {
            tracing::warn!(error = %e, fallback = fallback.len(), "Falling back to default ICE servers");
            fallback.to_vec()
        }
    }
}
