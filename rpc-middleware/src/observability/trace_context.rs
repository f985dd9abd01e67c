//! W3C Trace Context propagation for outgoing calls.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::grpc::context::Metadata;

/// Metadata key for W3C traceparent
pub const TRACEPARENT_KEY: &str = "traceparent";

/// Metadata key for W3C tracestate
pub const TRACESTATE_KEY: &str = "tracestate";

/// Writes the trace context of a span into outgoing metadata.
pub trait TracePropagator: Send + Sync {
    fn inject(&self, span: &Span, metadata: &mut Metadata);
}

/// Propagates the OpenTelemetry context attached to `tracing` spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct W3cPropagator;

impl TracePropagator for W3cPropagator {
    fn inject(&self, span: &Span, metadata: &mut Metadata) {
        let context = span.context();
        let otel_span = context.span();
        let span_context = otel_span.span_context();

        if span_context.is_valid() {
            // Format: version-trace_id-span_id-trace_flags
            let traceparent = format!(
                "00-{}-{}-{:02x}",
                span_context.trace_id(),
                span_context.span_id(),
                span_context.trace_flags().to_u8()
            );
            metadata.insert(TRACEPARENT_KEY, vec![traceparent]);

            let tracestate = span_context.trace_state().header();
            if !tracestate.is_empty() {
                metadata.insert(TRACESTATE_KEY, vec![tracestate]);
            }
        }
    }
}

/// Propagator that writes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn inject(&self, _span: &Span, _metadata: &mut Metadata) {}
}

/// Extract the traceparent of an incoming call.
pub fn extract_traceparent(metadata: &Metadata) -> Option<&str> {
    metadata.first(TRACEPARENT_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_empty_context() {
        let mut metadata = Metadata::new();
        W3cPropagator.inject(&Span::none(), &mut metadata);
        // Without an active OpenTelemetry span, nothing is written
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_extract_traceparent() {
        let mut metadata = Metadata::new();
        metadata.append(
            TRACEPARENT_KEY,
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        );
        assert_eq!(
            extract_traceparent(&metadata),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
    }
}
