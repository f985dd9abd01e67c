//! Protocol bridge: the last interceptor of every chain.
//!
//! It owns the per-call behaviour user interceptors cannot replace: the call
//! span, metadata assembly, timeout resolution and status translation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{Instrument, field};

use super::context::{guarded, propagate};
use super::error::{CallError, from_call_error};
use super::interceptors::{CallResult, Interceptor, Next, UnaryRequest};
use super::status::{BusinessCode, Status};
use super::timeout;
use crate::observability::{TracePropagator, extract_traceparent};

/// Resolve the timeout and tighten the context deadline, failing fast when it
/// has already elapsed.
fn apply_deadline(request: &mut UnaryRequest) -> Result<(), CallError> {
    let ctx = &mut request.ctx;
    let timeout = timeout::resolve(ctx.timeout, &ctx.method, &ctx.config);
    let now = Instant::now();
    // None: no deadline before and the timeout is out of the clock's range
    let Some(deadline) = timeout::shrink(ctx.deadline, now, timeout) else {
        return Ok(());
    };
    if deadline <= now {
        return Err(Status::new(BusinessCode::Deadline).into());
    }
    ctx.deadline = Some(deadline);
    Ok(())
}

/// Client-side bridge bound to the caller chain of one connection.
pub struct ClientBridge {
    callers: Vec<String>,
    propagator: Arc<dyn TracePropagator>,
}

impl ClientBridge {
    pub fn new(callers: Vec<String>, propagator: Arc<dyn TracePropagator>) -> Self {
        Self { callers, propagator }
    }
}

#[async_trait]
impl Interceptor for ClientBridge {
    async fn intercept(&self, mut request: UnaryRequest, next: Next<'_>) -> CallResult {
        let span = tracing::info_span!(
            "rpc.client",
            rpc.method = %request.ctx.method,
            peer.address = field::Empty,
            rpc.code = field::Empty,
        );
        if let Some(peer) = &request.ctx.peer {
            span.record("peer.address", peer.as_str());
        }
        propagate(&mut request.ctx, &self.callers, &span, self.propagator.as_ref());

        let call_span = span.clone();
        async move {
            if let Err(err) = apply_deadline(&mut request) {
                return Err(err);
            }
            let result = next.run(request).await.map_err(|err| {
                // keeps the wire message when the status came from the table
                CallError::Status(from_call_error(err))
            });
            if let Err(err) = &result {
                call_span.record("rpc.code", err.code().code());
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Server-side bridge: deadline enforcement around the handler.
pub struct ServerBridge {
    tags: BTreeMap<String, String>,
}

impl ServerBridge {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        Self { tags }
    }
}

#[async_trait]
impl Interceptor for ServerBridge {
    async fn intercept(&self, mut request: UnaryRequest, next: Next<'_>) -> CallResult {
        let span = tracing::info_span!(
            "rpc.server",
            rpc.method = %request.ctx.method,
            rpc.caller = request.ctx.caller(),
            peer.address = request.ctx.peer.as_deref(),
            traceparent = extract_traceparent(&request.ctx.incoming),
            tags = ?self.tags,
            rpc.code = field::Empty,
        );

        let call_span = span.clone();
        async move {
            if let Err(err) = apply_deadline(&mut request) {
                return Err(err);
            }
            let deadline = request.ctx.deadline;
            let cancel = request.ctx.cancel.clone();
            let result = guarded(deadline, &cancel, next.run(request))
                .await
                .and_then(|result| result)
                .map_err(|err| CallError::Status(from_call_error(err)));
            if let Err(err) = &result {
                call_span.record("rpc.code", err.code().code());
            }
            result
        }
        .instrument(span)
        .await
    }
}
