//! Shared fixtures for rpc-middleware integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rpc_middleware::async_trait::async_trait;
use rpc_middleware::config::{CallConfig, ServerSettings};
use rpc_middleware::grpc::context::GRPC_TIMEOUT_KEY;
use rpc_middleware::grpc::{
    CallError, CallResult, Client, Conn, Interceptor, Invoker, Next, Payload, Server, Status,
    UnaryRequest,
};
use rpc_middleware::observability::MetricsRegistry;

pub const ECHO_METHOD: &str = "/test.Echo/Say";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoReply {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub caller: String,
    #[prost(uint64, tag = "3")]
    pub remaining_ms: u64,
}

pub fn call_config(timeout: Duration) -> CallConfig {
    CallConfig {
        timeout,
        keep_alive_interval: Duration::from_secs(60),
        keep_alive_timeout: Duration::from_secs(20),
        non_block: true,
        ..Default::default()
    }
}

pub fn server_settings(timeout: Duration) -> ServerSettings {
    ServerSettings {
        call: call_config(timeout),
        addr: "127.0.0.1:0".to_string(),
        tags: Default::default(),
    }
}

pub fn client_payload(timeout: &str) -> String {
    format!(
        r#"{{
            "target": "127.0.0.1:1",
            "timeout": "{timeout}",
            "keepAliveInterval": "60s",
            "keepAliveTimeout": "20s",
            "nonBlock": true
        }}"#
    )
}

/// Lazily connected conn; never touches the network unless a tonic invoker
/// is used.
pub async fn conn(client: Client, caller: &str) -> Conn {
    Arc::new(client)
        .dial("127.0.0.1:1", vec![caller.to_string()])
        .await
        .unwrap()
}

pub fn registry() -> Arc<MetricsRegistry> {
    Arc::new(MetricsRegistry::new().unwrap())
}

/// Value of the first sample of `name` carrying every label in `labels`.
pub fn sample(text: &str, name: &str, labels: &[&str]) -> Option<f64> {
    text.lines()
        .filter(|line| line.starts_with(name) && !line.starts_with('#'))
        .filter(|line| line[name.len()..].starts_with(['{', ' ']))
        .find(|line| labels.iter().all(|label| line.contains(label)))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

pub type Journal = Arc<Mutex<Vec<String>>>;

/// Appends its name to a shared journal and continues.
pub struct Recorder {
    pub name: &'static str,
    pub journal: Journal,
}

#[async_trait]
impl Interceptor for Recorder {
    async fn intercept(&self, request: UnaryRequest, next: Next<'_>) -> CallResult {
        self.journal.lock().push(self.name.to_string());
        next.run(request).await
    }
}

/// Terminal invoker answering every call locally.
pub struct Reply {
    pub journal: Journal,
}

#[async_trait]
impl Invoker for Reply {
    async fn invoke(&self, request: UnaryRequest) -> CallResult {
        self.journal.lock().push("invoker".to_string());
        let caller = request.ctx.callers.join(",");
        let remaining_ms = request
            .ctx
            .remaining()
            .map(|remaining| remaining.as_millis() as u64)
            .unwrap_or_default();
        let message = request
            .body
            .downcast_ref::<EchoRequest>()
            .map(|req| req.message.clone())
            .unwrap_or_default();
        Ok(Payload::loggable(EchoReply {
            message,
            caller,
            remaining_ms,
        }))
    }
}

/// Carries a client call into a server in-process, going through the same
/// metadata and status encoding a network hop would.
pub struct Loopback {
    pub server: Arc<Server>,
}

#[async_trait]
impl Invoker for Loopback {
    async fn invoke(&self, request: UnaryRequest) -> CallResult {
        let UnaryRequest { ctx, body } = request;
        let message = body
            .downcast::<EchoRequest>()
            .map_err(|_| CallError::Status(Status::new(rpc_middleware::BusinessCode::RequestErr)))?;

        let mut wire = tonic::Request::new(message);
        ctx.outgoing.write_to(wire.metadata_mut());
        if let Some(remaining) = ctx.remaining() {
            let timeout = format!("{}m", remaining.as_millis());
            wire.metadata_mut()
                .insert(GRPC_TIMEOUT_KEY, timeout.parse().unwrap());
        }

        let reply = self
            .server
            .unary(ECHO_METHOD, wire, |ctx, req: EchoRequest| async move {
                if req.message == "missing" {
                    return Err(Status::with_message(
                        rpc_middleware::BusinessCode::NothingFound,
                        "no such user",
                    ));
                }
                if req.message == "slow" {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(EchoReply {
                    message: req.message,
                    caller: ctx.caller().unwrap_or_default().to_string(),
                    remaining_ms: ctx
                        .remaining()
                        .map(|remaining| remaining.as_millis() as u64)
                        .unwrap_or_default(),
                })
            })
            .await?;
        Ok(Payload::loggable(reply.into_inner()))
    }
}
