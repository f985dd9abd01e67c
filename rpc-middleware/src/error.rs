use thiserror::Error;

/// Failures while decoding or validating a published configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration published at [{0}]")]
    MissingPath(String),

    #[error("failed to decode configuration at [{path}]: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error("configuration at [{0}] was never activated")]
    Inactive(String),

    #[error("configuration at [{path}] failed to activate: {source}")]
    Fatal {
        path: String,
        #[source]
        source: Box<RpcError>,
    },

    #[error("failed to load engine settings: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failures while registering interceptors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("too many interceptors: {count} registered, at most {max} allowed")]
    TooMany { count: usize, max: usize },
}

/// Top-level error for building clients, servers and endpoints.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("invalid target [{target}]: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("dial [{target}] failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("invalid listen address [{addr}]: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("dial [{0}] timed out")]
    DialTimeout(String),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("tracing setup error: {0}")]
    Tracing(#[from] opentelemetry::trace::TraceError),

    #[error("tracing subscriber error: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
