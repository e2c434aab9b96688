#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    routing::get,
    Json, Router,
};
use counter_contracts::counter::{Bucket, CounterCodec};
use counter_engines::metrics::{MetricsError, MetricsSink, PrometheusMetricsSink};
use counter_storage::{CounterRepository, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("ledger read failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterHealthResponse {
    pub status: String,
    pub ledger_attached: bool,
    pub reason: Option<String>,
}

/// State shared by the exporter routes.
pub struct ExporterRuntime {
    sink: Arc<PrometheusMetricsSink>,
    codec: Arc<CounterCodec>,
    ledger: Option<Arc<dyn CounterRepository>>,
}

impl ExporterRuntime {
    pub fn new(sink: Arc<PrometheusMetricsSink>, codec: Arc<CounterCodec>) -> Self {
        Self {
            sink,
            codec,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn CounterRepository>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn sink(&self) -> &Arc<PrometheusMetricsSink> {
        &self.sink
    }

    /// Sets the last-sequence gauge of every ledger bucket to its current
    /// maximum. Returns the number of buckets touched.
    pub fn refresh_from_ledger(&self) -> Result<usize, ExportError> {
        let Some(ledger) = &self.ledger else {
            return Ok(0);
        };
        let mut maxima: BTreeMap<Bucket, u32> = BTreeMap::new();
        for record in ledger.ledger_records()? {
            let max = maxima.entry(record.bucket()).or_insert(0);
            *max = (*max).max(record.sequence);
        }
        for (bucket, max) in &maxima {
            let prefix = self.codec.prefixes().prefix_for(bucket.gender);
            self.sink
                .record_sequence_position(&bucket.year_code, prefix, *max)?;
        }
        Ok(maxima.len())
    }

    pub fn render_metrics(&self) -> Result<String, ExportError> {
        self.refresh_from_ledger()?;
        Ok(self.sink.render()?)
    }

    pub fn health_report(&self) -> Result<ExporterHealthResponse, ExportError> {
        if let Some(ledger) = &self.ledger {
            ledger.sequence_positions()?;
        }
        Ok(ExporterHealthResponse {
            status: "ok".to_string(),
            ledger_attached: self.ledger.is_some(),
            reason: None,
        })
    }
}

pub fn router(runtime: Arc<ExporterRuntime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(runtime)
}

async fn healthz(
    State(runtime): State<Arc<ExporterRuntime>>,
) -> (StatusCode, Json<ExporterHealthResponse>) {
    match runtime.health_report() {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ExporterHealthResponse {
                status: "error".to_string(),
                ledger_attached: true,
                reason: Some(err.to_string()),
            }),
        ),
    }
}

async fn metrics(
    State(runtime): State<Arc<ExporterRuntime>>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    match runtime.render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            body,
        ),
        Err(err) => {
            tracing::warn!(event = "counter_metrics_scrape_failed", error = %err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                err.to_string(),
            )
        }
    }
}
