#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use counter_contracts::counter::{CounterCodec, Gender, YearCode};
use counter_engines::metrics::{MetricsSink, PrometheusMetricsSink};
use counter_engines::year::FixedYearProvider;
use counter_os::backfill::read_records;
use counter_os::{
    assign_counter, AssignCounterResponse, AuditReport, BackfillReconciler, BackfillReport,
    ConfigError, CounterConfig, CounterError, CounterService, LedgerAuditor,
};
use counter_storage::CounterRepository;

/// Resolves settings with flag overrides taking precedence over `env`.
pub fn load_config(
    overrides: &BTreeMap<&'static str, String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CounterConfig, ConfigError> {
    CounterConfig::from_lookup(|var| overrides.get(var).cloned().or_else(|| env(var)))
}

/// Service for operator commands. A pinned `year` replaces the cutover
/// calendar so historical cohorts can be backfilled.
pub fn build_service(
    config: &CounterConfig,
    ledger: Arc<dyn CounterRepository>,
    metrics: Arc<dyn MetricsSink>,
    year: Option<&str>,
) -> anyhow::Result<CounterService> {
    let service = CounterService::from_config(config, ledger, metrics)?;
    Ok(match year {
        Some(raw) => {
            let year_code = YearCode::new(raw).context("invalid --year")?;
            service.with_year_provider(Arc::new(FixedYearProvider::new(year_code)))
        }
        None => service,
    })
}

/// Accepts the same gender aliases as backfill input.
pub fn execute_assign(
    service: &CounterService,
    national_id: &str,
    gender: &str,
    year: Option<&str>,
) -> AssignCounterResponse {
    match Gender::parse_alias(gender) {
        Ok(g) => assign_counter(service, national_id, i64::from(g.code()), year),
        Err(e) => AssignCounterResponse {
            ok: false,
            payload: CounterError::InvalidGender(e).to_payload(),
        },
    }
}

pub fn execute_backfill<R: Read, W: Write>(
    service: &CounterService,
    input: R,
    output: W,
    dry_run: bool,
) -> anyhow::Result<BackfillReport> {
    let records = read_records(input).context("failed to read backfill input")?;
    let report = BackfillReconciler::new(service)
        .run(&records, dry_run)
        .context("backfill planning failed")?;
    report
        .write_csv(output)
        .context("failed to write backfill report")?;
    tracing::info!(
        event = "counter_backfill_finished",
        dry_run,
        rows = report.rows.len(),
        actions = report.actions().len(),
    );
    Ok(report)
}

pub fn execute_audit(
    ledger: &dyn CounterRepository,
    codec: &CounterCodec,
) -> anyhow::Result<AuditReport> {
    LedgerAuditor::new(ledger, codec)
        .run()
        .context("ledger audit failed")
}

/// Writes the Prometheus text for everything the sink saw during this run.
pub fn write_metrics_snapshot(sink: &PrometheusMetricsSink, path: &Path) -> anyhow::Result<()> {
    let text = sink.render().context("failed to render metrics")?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}
