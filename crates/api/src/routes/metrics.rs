//! Prometheus metrics endpoint and saga metric descriptions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for the metrics the orchestrator emits.
/// Call once after the recorder is installed.
pub fn describe() {
    metrics::describe_counter!("saga_runs_total", "Times a worker started driving a saga");
    metrics::describe_counter!("saga_completed_total", "Sagas that completed every step");
    metrics::describe_counter!("saga_compensated_total", "Sagas fully compensated");
    metrics::describe_counter!("saga_parked_total", "Sagas parked for operator attention");
    metrics::describe_counter!("saga_step_retries_total", "Step attempts retried after a transient failure");
    metrics::describe_counter!("saga_step_timeouts_total", "Step dispatches that exceeded their timeout");
    metrics::describe_counter!(
        "saga_compensation_failures_total",
        "Compensating actions that failed or timed out"
    );
    metrics::describe_histogram!(
        "saga_duration_seconds",
        Unit::Seconds,
        "Time from saga start to completion or compensation"
    );
}

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
