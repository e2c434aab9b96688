#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use counter_adapter::{router, ExporterRuntime};
use counter_engines::metrics::PrometheusMetricsSink;
use counter_os::CounterConfig;
use counter_storage::SqliteCounterLedger;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CounterConfig::from_env().context("failed to load counter config")?;
    let ledger = SqliteCounterLedger::open(&config.database_path).with_context(|| {
        format!(
            "failed to open counter ledger at {}",
            config.database_path.display()
        )
    })?;
    let codec = config.codec().context("invalid counter format")?;
    let sink = Arc::new(PrometheusMetricsSink::new()?);
    let runtime = Arc::new(
        ExporterRuntime::new(sink.clone(), Arc::new(codec)).with_ledger(Arc::new(ledger)),
    );

    let listener = tokio::net::TcpListener::bind(config.metrics_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.metrics_bind))?;
    sink.mark_http_started();
    tracing::info!(
        event = "counter_metrics_http_started",
        bind = %config.metrics_bind,
        env = config.deploy_env.as_str(),
        "metrics exporter listening"
    );
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("metrics exporter shutting down");
        })
        .await?;
    Ok(())
}
