pub mod call;
pub mod watcher;

pub use call::{CallConfig, ClientSettings, ServerSettings};
pub use watcher::{
    ConfigListener, ConfigSource, ConfigWatcher, MemorySource, Outcome, Reloadable, Subscription,
    SubscriptionId,
};

use crate::error::ConfigError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Process-level settings for the engine, loaded once at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    pub system_id: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:7070".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineSettings {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("rpc").required(false))
            .add_source(config::Environment::with_prefix("RPC").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
