//! Per-instance call configuration published by the config source.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Timeouts, keepalive and feature flags for a client or a server.
///
/// Published configurations are immutable; a change replaces the whole value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfig {
    /// Dial-scoped timeout, independent of per-call timeouts.
    #[serde(default, with = "humantime_serde")]
    pub dial: Duration,
    /// Default per-call timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    /// Overrides keyed by exact method path, e.g. `/pkg.Greeter/SayHello`.
    #[serde(default)]
    pub method: HashMap<String, CallConfig>,
    #[serde(default)]
    pub non_block: bool,
    #[serde(default, with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub keep_alive_timeout: Duration,
    #[serde(default)]
    pub permit_without_stream: bool,
    #[serde(default)]
    pub enable_log: bool,
}

impl CallConfig {
    /// Reject configurations whose required durations are zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::NonPositive("timeout"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::NonPositive("keepAliveInterval"));
        }
        if self.keep_alive_timeout.is_zero() {
            return Err(ConfigError::NonPositive("keepAliveTimeout"));
        }
        Ok(())
    }

    /// Per-method entry whose key equals `method` exactly.
    pub fn for_method(&self, method: &str) -> Option<&CallConfig> {
        self.method.get(method)
    }
}

/// Client configuration: call settings plus the dial target.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientSettings {
    #[serde(flatten)]
    pub call: CallConfig,
    #[serde(default)]
    pub target: String,
}

impl AsRef<CallConfig> for ClientSettings {
    fn as_ref(&self) -> &CallConfig {
        &self.call
    }
}

/// Server configuration: call settings, listen address and span tags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerSettings {
    #[serde(flatten)]
    pub call: CallConfig,
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Static attributes attached to every server span.
    #[serde(default, rename = "tag")]
    pub tags: BTreeMap<String, String>,
}

fn default_addr() -> String {
    "0.0.0.0:9000".to_string()
}

impl AsRef<CallConfig> for ServerSettings {
    fn as_ref(&self) -> &CallConfig {
        &self.call
    }
}
