//! Server and client configuration.
//!
//! Both configs have sensible defaults and can be loaded from JSON, e.g.
//!
//! ```
//! use pubsub_rpc::config::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{ "max_concurrent_handlers": 32 }"#).unwrap();
//! assert_eq!(config.max_concurrent_handlers, 32);
//! assert_eq!(config.subject_prefix, "rpc");
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::protocol::DEFAULT_SUBJECT_PREFIX;

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

fn default_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_string()
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Handlers allowed to run at once; further requests wait for a slot.
    pub max_concurrent_handlers: usize,
    /// Prefix for method subjects. Must match the clients'.
    pub subject_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            subject_prefix: default_prefix(),
        }
    }
}

impl ServerConfig {
    /// Parse from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for method subjects. Must match the servers'.
    pub subject_prefix: String,
    /// Timeout applied to calls whose context has no deadline.
    pub default_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_prefix(),
            default_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Parse from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Default timeout as a duration.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
