//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a transfer entering the downloading state
pub fn record_download_started(model_id: &str) {
    metrics::counter!("offlaine_downloads_started_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

pub fn record_download_completed(model_id: &str, bytes: u64) {
    metrics::counter!("offlaine_downloads_completed_total",
        "model" => model_id.to_string()
    )
    .increment(1);
    metrics::counter!("offlaine_downloaded_bytes_total").increment(bytes);
}

/// Record a failed transfer, labelled transport or integrity
pub fn record_download_failed(model_id: &str, kind: &'static str) {
    metrics::counter!("offlaine_downloads_failed_total",
        "model" => model_id.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_download_cancelled(model_id: &str) {
    metrics::counter!("offlaine_downloads_cancelled_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record bytes freed by deletes and optimization
pub fn record_bytes_reclaimed(bytes: u64) {
    metrics::counter!("offlaine_bytes_reclaimed_total").increment(bytes);
}

/// Record a benchmark run outcome (completed, failed, abandoned)
pub fn record_benchmark_run(outcome: &'static str) {
    metrics::counter!("offlaine_benchmark_runs_total",
        "outcome" => outcome
    )
    .increment(1);
}

pub fn update_installed_artifacts(count: usize) {
    metrics::gauge!("offlaine_installed_artifacts").set(count as f64);
}
