//! Per-call context: deadline, caller chain, metadata and cancellation.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tracing::Span;

use super::error::CallError;
use crate::config::CallConfig;
use crate::observability::TracePropagator;

/// gRPC metadata key carrying the caller-identity chain.
pub const CALLER_KEY: &str = "x-rpc-caller";

/// gRPC metadata key for the wire deadline.
pub const GRPC_TIMEOUT_KEY: &str = "grpc-timeout";

/// Largest value a `grpc-timeout` header can carry: eight digits of hours.
pub const MAX_GRPC_TIMEOUT: Duration = Duration::from_secs(99_999_999 * 3600);

/// Metadata map: key to ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key`.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), values);
    }

    /// Add one value to `key`, keeping existing ones.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0
            .entry(key.into().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Values of `key`; keys match case-insensitively.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(&key.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    /// Merge `other` into `self`; for keys present in both, `other` wins.
    pub fn merge(&mut self, other: Metadata) {
        for (key, values) in other.0 {
            self.0.insert(key, values);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collect the ASCII entries of a tonic metadata map.
    pub fn from_tonic(map: &MetadataMap) -> Self {
        let mut metadata = Metadata::new();
        for entry in map.iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry
                && let Ok(value) = value.to_str()
            {
                metadata.append(key.as_str(), value);
            }
        }
        metadata
    }

    /// Append every entry to a tonic metadata map, skipping invalid ones.
    pub fn write_to(&self, map: &mut MetadataMap) {
        for (key, values) in self.iter() {
            let Ok(name) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
                tracing::debug!(key, "Skipping invalid metadata key");
                continue;
            };
            for value in values {
                match AsciiMetadataValue::try_from(value.as_str()) {
                    Ok(value) => {
                        map.append(name.clone(), value);
                    }
                    Err(_) => tracing::debug!(key, "Skipping invalid metadata value"),
                }
            }
        }
    }
}

/// Everything an interceptor knows about the call in flight.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Full method path, e.g. `/pkg.Greeter/SayHello`.
    pub method: String,
    pub deadline: Option<Instant>,
    /// Calling services, outermost first.
    pub callers: Vec<String>,
    pub outgoing: Metadata,
    pub incoming: Metadata,
    /// Per-call timeout override; only positive values take effect.
    pub timeout: Option<Duration>,
    /// Dial target on the client, remote socket address on the server.
    pub peer: Option<String>,
    pub cancel: CancellationToken,
    /// Configuration snapshot taken when the call started.
    pub config: Arc<CallConfig>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, config: Arc<CallConfig>) -> Self {
        Self {
            method: method.into(),
            deadline: None,
            callers: Vec::new(),
            outgoing: Metadata::new(),
            incoming: Metadata::new(),
            timeout: None,
            peer: None,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Context for a call received by a server.
    pub fn incoming(
        method: impl Into<String>,
        config: Arc<CallConfig>,
        metadata: &MetadataMap,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let incoming = Metadata::from_tonic(metadata);
        let mut ctx = Self::new(method, config);
        ctx.deadline = incoming
            .first(GRPC_TIMEOUT_KEY)
            .and_then(parse_grpc_timeout)
            .and_then(|timeout| Instant::now().checked_add(timeout));
        ctx.callers = incoming
            .get(CALLER_KEY)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        ctx.peer = remote_addr.map(|addr| addr.to_string());
        ctx.incoming = incoming;
        ctx
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Immediate caller: the last service in the chain.
    pub fn caller(&self) -> Option<&str> {
        self.callers.last().map(String::as_str)
    }
}

/// Caller-side knobs for a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
    pub cancel: Option<CancellationToken>,
    pub callers: Vec<String>,
}

impl CallOptions {
    /// Override the configured timeout for this call.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    /// Derive options from a server-side call so a downstream call keeps the
    /// deadline, the cancellation and the caller chain.
    pub fn inherit(ctx: &CallContext) -> Self {
        Self {
            deadline: ctx.deadline,
            cancel: Some(ctx.cancel.child_token()),
            callers: ctx.callers.clone(),
            ..Default::default()
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    pub(crate) fn into_context(self, method: &str, config: Arc<CallConfig>) -> CallContext {
        let mut ctx = CallContext::new(method, config);
        ctx.timeout = self.timeout;
        ctx.deadline = self.deadline;
        ctx.outgoing = self.metadata;
        ctx.callers = self.callers;
        if let Some(cancel) = self.cancel {
            ctx.cancel = cancel;
        }
        ctx
    }
}

/// Assemble outgoing metadata: caller chain and trace context first, then the
/// metadata the caller already set, which wins on conflicting keys.
pub fn propagate(
    ctx: &mut CallContext,
    callers: &[String],
    span: &Span,
    propagator: &dyn TracePropagator,
) {
    let chain: Vec<String> = ctx.callers.iter().chain(callers).cloned().collect();
    let mut assembled = Metadata::new();
    assembled.insert(CALLER_KEY, chain.clone());
    propagator.inject(span, &mut assembled);
    assembled.merge(std::mem::take(&mut ctx.outgoing));
    ctx.outgoing = assembled;
    ctx.callers = chain;
}

/// Run `fut` until it completes, the deadline elapses or `cancel` fires.
pub async fn guarded<F>(
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, CallError>
where
    F: Future,
{
    let bounded = async move {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| CallError::DeadlineExceeded),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CallError::Canceled),
        out = bounded => out,
    }
}

/// Parse a `grpc-timeout` header value: up to 8 digits and a unit.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopPropagator;

    #[test]
    fn test_metadata_merge_last_writer_wins() {
        let mut base = Metadata::new();
        base.insert("a", vec!["1".into()]);
        base.insert("b", vec!["2".into()]);

        let mut later = Metadata::new();
        later.insert("b", vec!["3".into(), "4".into()]);
        base.merge(later);

        assert_eq!(base.get("a"), Some(&["1".to_string()][..]));
        assert_eq!(base.get("b"), Some(&["3".to_string(), "4".to_string()][..]));
    }

    #[test]
    fn test_lookup_ignores_key_case() {
        let mut metadata = Metadata::new();
        metadata.append("X-Tenant", "acme");
        metadata.insert("X-Request-Id", vec!["r-1".into()]);

        assert_eq!(metadata.first("X-Tenant"), Some("acme"));
        assert_eq!(metadata.first("x-tenant"), Some("acme"));
        assert_eq!(metadata.get("X-REQUEST-ID"), Some(&["r-1".to_string()][..]));
    }

    #[test]
    fn test_tonic_round_trip() {
        let mut metadata = Metadata::new();
        metadata.append("X-Tenant", "acme");
        metadata.append(CALLER_KEY, "svc-a");
        metadata.append(CALLER_KEY, "svc-b");

        let mut map = MetadataMap::new();
        metadata.write_to(&mut map);
        assert_eq!(Metadata::from_tonic(&map), metadata);
    }

    #[test]
    fn test_propagate_keeps_existing_outgoing() {
        let mut ctx = CallContext::new("/test.Svc/Call", Arc::new(CallConfig::default()));
        ctx.callers = vec!["gateway".into()];
        ctx.outgoing.insert(CALLER_KEY, vec!["override".into()]);
        ctx.outgoing.append("x-tenant", "acme");

        propagate(&mut ctx, &["billing".to_string()], &Span::none(), &NoopPropagator);

        assert_eq!(ctx.callers, vec!["gateway".to_string(), "billing".to_string()]);
        assert_eq!(ctx.outgoing.first(CALLER_KEY), Some("override"));
        assert_eq!(ctx.outgoing.first("x-tenant"), Some("acme"));
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("S"), None);
    }

    #[test]
    fn test_incoming_reads_callers_and_deadline() {
        let mut map = MetadataMap::new();
        map.append(CALLER_KEY, "gateway".parse().unwrap());
        map.append(GRPC_TIMEOUT_KEY, "5S".parse().unwrap());

        let ctx = CallContext::incoming(
            "/test.Svc/Call",
            Arc::new(CallConfig::default()),
            &map,
            Some("10.0.0.1:5000".parse().unwrap()),
        );
        assert_eq!(ctx.caller(), Some("gateway"));
        assert_eq!(ctx.peer.as_deref(), Some("10.0.0.1:5000"));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5) && remaining > Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_guarded_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = guarded(None, &cancel, std::future::pending::<()>()).await;
        assert!(matches!(result, Err(CallError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_deadline() {
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        let result = guarded(Some(deadline), &cancel, std::future::pending::<()>()).await;
        assert!(matches!(result, Err(CallError::DeadlineExceeded)));
    }
}
