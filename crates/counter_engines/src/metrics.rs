#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use counter_contracts::counter::{Gender, YearCode};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics backend unavailable: {0}")]
    Backend(String),

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics text is not utf-8")]
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictKind {
    /// Lost the bind race; the re-read found the winner's record.
    LedgerRace,
    /// Retries exhausted without the subject becoming visible.
    Unresolved,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::LedgerRace => "ledger_race",
            ConflictKind::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MismatchKind {
    GenderPrefix,
}

impl MismatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MismatchKind::GenderPrefix => "gender_prefix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterEvent {
    Reuse { year_code: YearCode, gender: Gender },
    Generated { year_code: YearCode, gender: Gender },
    Conflict { kind: ConflictKind },
    Overflow { year_code: YearCode, gender: Gender },
    BackfillMismatch { kind: MismatchKind },
}

impl CounterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CounterEvent::Reuse { .. } => "reuse",
            CounterEvent::Generated { .. } => "generated",
            CounterEvent::Conflict { .. } => "conflict",
            CounterEvent::Overflow { .. } => "overflow",
            CounterEvent::BackfillMismatch { .. } => "backfill_mismatch",
        }
    }
}

/// Receives allocation events synchronously. Callers log and drop failures.
pub trait MetricsSink: Send + Sync {
    fn record_event(&self, event: &CounterEvent) -> Result<(), MetricsError>;

    fn record_sequence_position(
        &self,
        year_code: &YearCode,
        prefix: &str,
        sequence: u32,
    ) -> Result<(), MetricsError>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for std::sync::Arc<S> {
    fn record_event(&self, event: &CounterEvent) -> Result<(), MetricsError> {
        (**self).record_event(event)
    }

    fn record_sequence_position(
        &self,
        year_code: &YearCode,
        prefix: &str,
        sequence: u32,
    ) -> Result<(), MetricsError> {
        (**self).record_sequence_position(year_code, prefix, sequence)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_event(&self, _event: &CounterEvent) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_sequence_position(
        &self,
        _year_code: &YearCode,
        _prefix: &str,
        _sequence: u32,
    ) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Prometheus-backed sink. Each instance owns its registry so several sinks
/// can coexist in one process.
#[derive(Clone)]
pub struct PrometheusMetricsSink {
    registry: Registry,
    reuse: IntCounterVec,
    generated: IntCounterVec,
    conflict: IntCounterVec,
    overflow: IntCounterVec,
    backfill_mismatch: IntCounterVec,
    last_sequence_position: IntGaugeVec,
    http_started: IntGauge,
}

impl std::fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsSink").finish_non_exhaustive()
    }
}

impl PrometheusMetricsSink {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let reuse = IntCounterVec::new(
            Opts::new("counter_reuse_total", "Existing counters returned"),
            &["year", "gender"],
        )?;
        let generated = IntCounterVec::new(
            Opts::new("counter_generated_total", "New counters allocated"),
            &["year", "gender"],
        )?;
        let conflict = IntCounterVec::new(
            Opts::new("counter_conflict_total", "Bind conflicts by outcome"),
            &["type"],
        )?;
        let overflow = IntCounterVec::new(
            Opts::new("counter_overflow_total", "Exhausted bucket allocations"),
            &["year", "gender"],
        )?;
        let backfill_mismatch = IntCounterVec::new(
            Opts::new(
                "counter_backfill_mismatch_total",
                "Backfill findings that need manual review",
            ),
            &["type"],
        )?;
        let last_sequence_position = IntGaugeVec::new(
            Opts::new(
                "counter_last_sequence_position",
                "Last allocated sequence per bucket",
            ),
            &["year", "prefix"],
        )?;
        let http_started = IntGauge::new(
            "counter_metrics_http_started",
            "1 once the metrics exporter is listening",
        )?;

        registry.register(Box::new(reuse.clone()))?;
        registry.register(Box::new(generated.clone()))?;
        registry.register(Box::new(conflict.clone()))?;
        registry.register(Box::new(overflow.clone()))?;
        registry.register(Box::new(backfill_mismatch.clone()))?;
        registry.register(Box::new(last_sequence_position.clone()))?;
        registry.register(Box::new(http_started.clone()))?;

        Ok(Self {
            registry,
            reuse,
            generated,
            conflict,
            overflow,
            backfill_mismatch,
            last_sequence_position,
            http_started,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn mark_http_started(&self) {
        self.http_started.set(1);
    }

    /// Prometheus text exposition of every registered family.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|_| MetricsError::Encoding)
    }
}

fn gender_label(gender: Gender) -> String {
    gender.code().to_string()
}

impl MetricsSink for PrometheusMetricsSink {
    fn record_event(&self, event: &CounterEvent) -> Result<(), MetricsError> {
        match event {
            CounterEvent::Reuse { year_code, gender } => self
                .reuse
                .get_metric_with_label_values(&[year_code.as_str(), &gender_label(*gender)])?
                .inc(),
            CounterEvent::Generated { year_code, gender } => self
                .generated
                .get_metric_with_label_values(&[year_code.as_str(), &gender_label(*gender)])?
                .inc(),
            CounterEvent::Conflict { kind } => self
                .conflict
                .get_metric_with_label_values(&[kind.as_str()])?
                .inc(),
            CounterEvent::Overflow { year_code, gender } => self
                .overflow
                .get_metric_with_label_values(&[year_code.as_str(), &gender_label(*gender)])?
                .inc(),
            CounterEvent::BackfillMismatch { kind } => self
                .backfill_mismatch
                .get_metric_with_label_values(&[kind.as_str()])?
                .inc(),
        }
        Ok(())
    }

    fn record_sequence_position(
        &self,
        year_code: &YearCode,
        prefix: &str,
        sequence: u32,
    ) -> Result<(), MetricsError> {
        self.last_sequence_position
            .get_metric_with_label_values(&[year_code.as_str(), prefix])?
            .set(i64::from(sequence));
        Ok(())
    }
}

/// In-process sink that keeps every event; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<CounterEvent>>,
    positions: Mutex<BTreeMap<(String, String), u32>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CounterEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }

    pub fn conflicts(&self, kind: ConflictKind) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CounterEvent::Conflict { kind: k } if *k == kind))
            .count()
    }

    pub fn sequence_position(&self, year_code: &str, prefix: &str) -> Option<u32> {
        self.positions
            .lock()
            .ok()?
            .get(&(year_code.to_string(), prefix.to_string()))
            .copied()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record_event(&self, event: &CounterEvent) -> Result<(), MetricsError> {
        self.events
            .lock()
            .map_err(|_| MetricsError::Backend("recording sink poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    fn record_sequence_position(
        &self,
        year_code: &YearCode,
        prefix: &str,
        sequence: u32,
    ) -> Result<(), MetricsError> {
        self.positions
            .lock()
            .map_err(|_| MetricsError::Backend("recording sink poisoned".to_string()))?
            .insert((year_code.as_str().to_string(), prefix.to_string()), sequence);
        Ok(())
    }
}
