//! rpc-middleware: config-driven gRPC clients and servers with a shared
//! interceptor chain, business status codes and hot-reloaded call settings.
pub mod config;
pub mod engine;
pub mod error;
pub mod grpc;
pub mod observability;

pub use config::{CallConfig, ClientSettings, ConfigSource, EngineSettings, MemorySource, ServerSettings};
pub use engine::Engine;
pub use error::{ChainError, ConfigError, RpcError};
pub use grpc::{BusinessCode, CallContext, CallOptions, Client, Conn, Interceptor, Server, Status};

pub use async_trait;
pub use prost;
pub use tokio;
pub use tonic;
pub use tracing;
