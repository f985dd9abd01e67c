//! Metrics collection and Prometheus export.
//!
//! Each instance records into an explicitly constructed [`MetricsRegistry`]
//! instead of a process-wide recorder.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

use crate::error::RpcError;

/// Histogram buckets for request durations, in milliseconds.
pub const DURATION_BUCKETS_MS: [f64; 8] = [5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

pub const SERVER_DURATION: &str = "rpc_server_requests_duration_ms";
pub const SERVER_CODE_TOTAL: &str = "rpc_server_requests_code_total";
pub const CLIENT_DURATION: &str = "rpc_client_requests_duration_ms";
pub const CLIENT_CODE_TOTAL: &str = "rpc_client_requests_code_total";

/// Prometheus recorder owned by the caller and shared by instances.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, RpcError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_ms".to_string()),
                &DURATION_BUCKETS_MS,
            )?
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::describe_histogram!(SERVER_DURATION, "rpc server requests duration(ms).");
            metrics::describe_counter!(SERVER_CODE_TOTAL, "rpc server requests code count.");
            metrics::describe_histogram!(CLIENT_DURATION, "rpc client requests duration(ms).");
            metrics::describe_counter!(CLIENT_CODE_TOTAL, "rpc client requests code count.");
        });

        Ok(Self { recorder, handle })
    }

    /// Run `f` with this registry installed as the current recorder, so the
    /// `metrics` macros inside record here.
    pub fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.recorder, f)
    }

    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

/// Serve `GET /metrics` on `addr`.
pub async fn start_metrics_server(
    registry: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, RpcError> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move { registry.render() }
        }),
    );

    tracing::info!(%addr, "Starting metrics server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    Ok(handle)
}
