pub mod logging;
pub mod registry;
pub mod trace_context;

pub use logging::{init_from_settings, init_tracing};
pub use registry::{MetricsRegistry, start_metrics_server};
pub use trace_context::{
    NoopPropagator, TRACEPARENT_KEY, TRACESTATE_KEY, TracePropagator, W3cPropagator,
    extract_traceparent,
};
