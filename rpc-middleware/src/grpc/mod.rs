//! gRPC middleware: interceptor chain, status translation and the client and
//! server instances built on them.
//!
//! - Business status codes and their wire encoding
//! - Per-call context, metadata propagation and timeout resolution
//! - Recovery, observer and bridge interceptors
//! - Config-driven client and server instances

pub mod bridge;
pub mod client;
pub mod context;
pub mod error;
pub mod interceptors;
pub mod observer;
pub mod proto;
pub mod server;
pub mod status;
pub mod timeout;

pub use bridge::{ClientBridge, ServerBridge};
pub use client::{Client, ClientBuilder, Conn, TonicInvoker};
pub use context::{CALLER_KEY, CallContext, CallOptions, Metadata};
pub use error::{CallError, IntoStatus, from_error, from_wire, to_wire};
pub use interceptors::{
    CallResult, Interceptor, InterceptorChain, Invoker, LogBody, MAX_INTERCEPTORS, Next, Payload,
    Recovery, UnaryRequest,
};
pub use observer::{ClientObserver, ServerObserver};
pub use server::{HandlerInvoker, Server, ServerBuilder};
pub use status::{BusinessCode, Status};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response};
