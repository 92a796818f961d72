//! Service configuration.
//!
//! A [`ServiceConfig`] can be built in code, loaded from a TOML file, or
//! assembled by the CLI from flags layered over an optional file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SearchError};

/// Default management endpoint of a local Splunk instance.
pub const DEFAULT_URI: &str = "https://localhost:8089";

/// Capacity of the per-session row queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Connection settings for one Splunk service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URI of the management port, e.g. `https://localhost:8089`.
    pub uri: String,
    pub username: String,
    pub password: String,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum wait for any single read from the export stream, in seconds.
    /// First-byte latency on a large search can be many minutes.
    pub read_timeout_secs: u64,
    /// Rows buffered between the search worker and the consumer.
    pub queue_capacity: usize,
    /// Accept self-signed certificates (Splunk ships one on 8089).
    pub accept_invalid_certs: bool,
    /// Fail connection setup when login does not yield a session key.
    pub require_auth: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            username: "admin".to_string(),
            password: "changeme".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 1800,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            accept_invalid_certs: false,
            require_auth: false,
        }
    }
}

impl ServiceConfig {
    /// Config for `uri` with default credentials and timeouts.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_secs = timeout.as_secs();
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SearchError::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SearchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate `uri`.
    ///
    /// Only scheme, host and port are kept; any path on the configured URI is
    /// ignored because endpoint paths are fixed by the service.
    pub fn endpoint(&self) -> Result<Url> {
        let parsed = Url::parse(&self.uri).map_err(|e| SearchError::InvalidEndpoint {
            uri: self.uri.clone(),
            detail: e.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| SearchError::InvalidEndpoint {
            uri: self.uri.clone(),
            detail: "missing host".to_string(),
        })?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| SearchError::InvalidEndpoint {
                uri: self.uri.clone(),
                detail: "missing port".to_string(),
            })?;
        let base = format!("{}://{}:{}/", parsed.scheme(), host, port);
        Url::parse(&base).map_err(|e| SearchError::InvalidEndpoint {
            uri: self.uri.clone(),
            detail: e.to_string(),
        })
    }
}
