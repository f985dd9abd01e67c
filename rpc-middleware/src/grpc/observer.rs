//! Metrics and call logging, second in every chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};

use super::interceptors::{CallResult, Interceptor, Next, UnaryRequest};
use super::status::BusinessCode;
use crate::observability::registry::{
    CLIENT_CODE_TOTAL, CLIENT_DURATION, MetricsRegistry, SERVER_CODE_TOTAL, SERVER_DURATION,
};

/// Server calls faster than this are not logged.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_millis(500);

/// Caller label for calls without a caller chain.
pub const NO_USER: &str = "no_user";

fn outcome(result: &CallResult) -> (BusinessCode, String) {
    match result {
        Ok(_) => (BusinessCode::Ok, String::new()),
        Err(err) => (err.code(), format!("{err:?}")),
    }
}

/// Client-side duration/code metrics and per-call logging.
#[derive(Debug, Clone)]
pub struct ClientObserver {
    registry: Arc<MetricsRegistry>,
}

impl ClientObserver {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Interceptor for ClientObserver {
    async fn intercept(&self, request: UnaryRequest, next: Next<'_>) -> CallResult {
        let started = Instant::now();
        let method = request.ctx.method.clone();
        // on the client side the peer is the dial target, not a socket address
        let dial_target = request.ctx.peer.clone().unwrap_or_default();
        let enable_log = request.ctx.config.enable_log;
        let args = request.body.log_body();

        let result = next.run(request).await;

        let elapsed = started.elapsed();
        let (code, stack) = outcome(&result);
        self.registry.record(|| {
            histogram!(CLIENT_DURATION, "method" => method.clone())
                .record(elapsed.as_millis() as f64);
            counter!(CLIENT_CODE_TOTAL, "method" => method.clone(), "code" => code.to_string())
                .increment(1);
        });

        if enable_log {
            let reply = result.as_ref().ok().and_then(|body| body.log_body());
            tracing::info!(
                path = %method,
                dial_target = %dial_target,
                ret = code.code(),
                ts = elapsed.as_secs_f64(),
                args = args.as_deref(),
                reply = reply.as_deref(),
                stack = (!stack.is_empty()).then_some(stack.as_str()),
                "rpc client call"
            );
        }
        result
    }
}

/// Server-side duration/code metrics and slow-call logging.
#[derive(Debug, Clone)]
pub struct ServerObserver {
    registry: Arc<MetricsRegistry>,
}

impl ServerObserver {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Interceptor for ServerObserver {
    async fn intercept(&self, request: UnaryRequest, next: Next<'_>) -> CallResult {
        let started = Instant::now();
        let method = request.ctx.method.clone();
        let caller = request.ctx.caller().unwrap_or(NO_USER).to_string();
        let peer = request.ctx.peer.clone().unwrap_or_default();
        let quota = request
            .ctx
            .remaining()
            .map(|remaining| remaining.as_secs_f64())
            .unwrap_or_default();
        let enable_log = request.ctx.config.enable_log;
        let req = request.body.log_body();

        let result = next.run(request).await;

        let elapsed = started.elapsed();
        let (code, stack) = outcome(&result);
        self.registry.record(|| {
            histogram!(SERVER_DURATION, "method" => method.clone(), "caller" => caller.clone())
                .record(elapsed.as_millis() as f64);
            counter!(
                SERVER_CODE_TOTAL,
                "method" => method.clone(),
                "caller" => caller.clone(),
                "code" => code.to_string()
            )
            .increment(1);
        });

        if enable_log && elapsed > SLOW_CALL_THRESHOLD {
            tracing::info!(
                user = %caller,
                ip = %peer,
                path = %method,
                ret = code.code(),
                ts = elapsed.as_secs_f64(),
                timeout_quota = quota,
                req = req.as_deref(),
                stack = (!stack.is_empty()).then_some(stack.as_str()),
                "rpc server call"
            );
        }
        result
    }
}
