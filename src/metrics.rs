//! Metric names and Prometheus exposition.
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

pub const EVENTS_CONSUMED: &str = "eltpipe_events_consumed_total";
pub const EVENTS_INSERTED: &str = "eltpipe_events_inserted_total";
pub const DEAD_LETTERS: &str = "eltpipe_dead_letter_total";
pub const BATCH_SIZE: &str = "eltpipe_batch_size";
pub const BATCH_WRITE_SECONDS: &str = "eltpipe_batch_write_seconds";
pub const BATCH_PROCESSING_SECONDS: &str = "eltpipe_batch_processing_seconds";
pub const EVENT_PROCESSING_SECONDS: &str = "eltpipe_event_processing_seconds";
pub const CURRENT_BATCH_SIZE: &str = "eltpipe_current_batch_size";
pub const LAST_COMMIT_TIMESTAMP: &str = "eltpipe_last_commit_timestamp";
pub const CONSECUTIVE_SINK_FAILURES: &str = "eltpipe_consecutive_sink_failures";
pub const SINK_FAILURE_ALERTS: &str = "eltpipe_sink_failure_alerts_total";
pub const STALE_STAGING_ROWS: &str = "eltpipe_stale_staging_rows_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing `/metrics` and `/_liveness`.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new()
        .route("/_liveness", get(|| std::future::ready("ok")))
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    recorder_builder()?.install_recorder()
}

/// Exporter configuration with the bucket layout of every histogram.
pub fn recorder_builder() -> Result<PrometheusBuilder, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];
    // routing one record is usually well under a millisecond
    const EVENT_SECONDS: &[f64] = &[
        0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
    ];
    const BATCH_SIZES: &[f64] = &[
        1.0, 10.0, 25.0, 50.0, 75.0, 100.0, 150.0, 200.0, 500.0, 1000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .set_buckets_for_metric(
            Matcher::Full(EVENT_PROCESSING_SECONDS.to_string()),
            EVENT_SECONDS,
        )?
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_string()), BATCH_SIZES)
}
