#![forbid(unsafe_code)]

use std::sync::Arc;

use counter_contracts::counter::{Bucket, CounterCodec, CounterRecord, NationalId, YearCode};
use counter_engines::hashing::SubjectHasher;
use counter_engines::metrics::{ConflictKind, CounterEvent, MetricsSink};
use counter_engines::year::{Clock, SystemClock, YearProvider};
use counter_storage::{CounterRepository, StorageError};
use uuid::Uuid;

use crate::config::{ConfigError, CounterConfig};
use crate::error::CounterError;

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    Generated(CounterRecord),
    Reused(CounterRecord),
    /// Lost the bind race; the winner's record is returned.
    ConflictResolved(CounterRecord),
}

impl AllocationOutcome {
    pub fn record(&self) -> &CounterRecord {
        match self {
            AllocationOutcome::Generated(r)
            | AllocationOutcome::Reused(r)
            | AllocationOutcome::ConflictResolved(r) => r,
        }
    }

    pub fn counter(&self) -> &str {
        &self.record().counter
    }

    pub fn into_record(self) -> CounterRecord {
        match self {
            AllocationOutcome::Generated(r)
            | AllocationOutcome::Reused(r)
            | AllocationOutcome::ConflictResolved(r) => r,
        }
    }
}

/// Idempotent counter allocation over a shared ledger.
pub struct CounterService {
    repo: Arc<dyn CounterRepository>,
    codec: Arc<CounterCodec>,
    year_provider: Arc<dyn YearProvider>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    hasher: SubjectHasher,
    conflict_retries: u32,
}

impl std::fmt::Debug for CounterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterService")
            .field("codec", &self.codec)
            .field("conflict_retries", &self.conflict_retries)
            .finish_non_exhaustive()
    }
}

impl CounterService {
    pub fn new(
        repo: Arc<dyn CounterRepository>,
        codec: Arc<CounterCodec>,
        year_provider: Arc<dyn YearProvider>,
        metrics: Arc<dyn MetricsSink>,
        hasher: SubjectHasher,
    ) -> Self {
        Self {
            repo,
            codec,
            year_provider,
            clock: Arc::new(SystemClock),
            metrics,
            hasher,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn from_config(
        config: &CounterConfig,
        repo: Arc<dyn CounterRepository>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            repo,
            Arc::new(config.codec()?),
            Arc::new(config.year_provider()?),
            metrics,
            config.hasher()?,
        )
        .with_conflict_retries(config.conflict_retries))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_year_provider(mut self, year_provider: Arc<dyn YearProvider>) -> Self {
        self.year_provider = year_provider;
        self
    }

    pub fn with_conflict_retries(mut self, attempts: u32) -> Self {
        self.conflict_retries = attempts.max(1);
        self
    }

    pub fn codec(&self) -> &CounterCodec {
        &self.codec
    }

    pub fn repository(&self) -> &Arc<dyn CounterRepository> {
        &self.repo
    }

    pub fn hasher(&self) -> &SubjectHasher {
        &self.hasher
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn current_year_code(&self) -> YearCode {
        self.year_provider.resolve(self.clock.now())
    }

    /// Returns the subject's counter, allocating one on first sight.
    pub fn get_or_create(
        &self,
        national_id: &str,
        gender: i64,
        year: Option<&str>,
    ) -> Result<String, CounterError> {
        self.allocate(national_id, gender, year)
            .map(|outcome| outcome.into_record().counter)
    }

    pub fn allocate(
        &self,
        national_id: &str,
        gender: i64,
        year: Option<&str>,
    ) -> Result<AllocationOutcome, CounterError> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("counter_allocate", %correlation_id);
        let _entered = span.enter();

        let national_id = NationalId::new(national_id).map_err(CounterError::InvalidNationalId)?;
        let (gender, prefix) = self
            .codec
            .prefixes()
            .prefix_for_code(gender)
            .map_err(CounterError::InvalidGender)?;
        let requested_year = year
            .map(YearCode::new)
            .transpose()
            .map_err(CounterError::InvalidYearCode)?;
        let national_id_hash = self
            .hasher
            .hash(&national_id)
            .map_err(CounterError::InvalidNationalId)?;

        if let Some(existing) = self.repo.find_by_subject(&national_id_hash)? {
            if let Some(requested) = &requested_year {
                if *requested != existing.year_code {
                    tracing::warn!(
                        event = "counter_old_year_reused",
                        national_id_hash = national_id_hash.as_str(),
                        stored_year = existing.year_code.as_str(),
                        requested_year = requested.as_str(),
                        "returning counter bound in an earlier year"
                    );
                }
            }
            self.emit(&CounterEvent::Reuse {
                year_code: existing.year_code.clone(),
                gender: existing.gender,
            });
            tracing::info!(
                event = "counter_reused",
                national_id_hash = national_id_hash.as_str(),
                counter = %CounterCodec::mask(&existing.counter),
            );
            return Ok(AllocationOutcome::Reused(existing));
        }

        let resolved = self.current_year_code();
        let year_code = match requested_year {
            Some(requested) if requested != resolved => {
                return Err(CounterError::YearMismatch {
                    requested,
                    resolved,
                })
            }
            Some(requested) => requested,
            None => resolved,
        };
        let bucket = Bucket::new(gender, year_code);

        for attempt in 1..=self.conflict_retries {
            match self
                .repo
                .reserve_and_bind(&self.codec, &national_id_hash, &bucket)
            {
                Ok(record) => {
                    self.emit(&CounterEvent::Generated {
                        year_code: bucket.year_code.clone(),
                        gender,
                    });
                    if let Err(e) = self.metrics.record_sequence_position(
                        &bucket.year_code,
                        prefix,
                        record.sequence,
                    ) {
                        tracing::warn!(error = %e, "sequence position gauge not updated");
                    }
                    tracing::info!(
                        event = "counter_generated",
                        national_id_hash = national_id_hash.as_str(),
                        bucket = %bucket,
                        sequence = record.sequence,
                        counter = %CounterCodec::mask(&record.counter),
                    );
                    return Ok(AllocationOutcome::Generated(record));
                }
                Err(StorageError::Conflict { .. }) => {
                    if let Some(winner) = self.repo.find_by_subject(&national_id_hash)? {
                        self.emit(&CounterEvent::Conflict {
                            kind: ConflictKind::LedgerRace,
                        });
                        tracing::info!(
                            event = "counter_conflict_resolved",
                            national_id_hash = national_id_hash.as_str(),
                            attempt,
                            counter = %CounterCodec::mask(&winner.counter),
                        );
                        return Ok(AllocationOutcome::ConflictResolved(winner));
                    }
                    tracing::warn!(
                        event = "counter_conflict_retry",
                        national_id_hash = national_id_hash.as_str(),
                        attempt,
                        "conflict reported but no bound record visible"
                    );
                }
                Err(StorageError::Overflow {
                    bucket,
                    max_sequence,
                }) => {
                    self.emit(&CounterEvent::Overflow {
                        year_code: bucket.year_code.clone(),
                        gender,
                    });
                    tracing::error!(
                        event = "counter_overflow",
                        bucket = %bucket,
                        max_sequence,
                        "bucket sequence space exhausted"
                    );
                    return Err(CounterError::Exhausted {
                        bucket,
                        max_sequence,
                    });
                }
                Err(other) => {
                    tracing::error!(event = "counter_storage_failure", error = %other);
                    return Err(CounterError::Storage(other));
                }
            }
        }

        self.emit(&CounterEvent::Conflict {
            kind: ConflictKind::Unresolved,
        });
        tracing::error!(
            event = "counter_conflict_unresolved",
            national_id_hash = national_id_hash.as_str(),
            attempts = self.conflict_retries,
        );
        Err(CounterError::Conflict {
            attempts: self.conflict_retries,
        })
    }

    fn emit(&self, event: &CounterEvent) {
        if let Err(e) = self.metrics.record_event(event) {
            tracing::warn!(metric = event.name(), error = %e, "metrics emission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{TimeZone, Utc};
    use counter_contracts::counter::{CounterFormat, Gender, PrefixMap, SubjectHash};
    use counter_engines::metrics::{MetricsError, RecordingMetricsSink};
    use counter_engines::year::{CutoverYearProvider, FixedClock};
    use counter_storage::{InMemoryCounterLedger, LedgerSnapshot, SqliteCounterLedger};
    use proptest::prelude::*;

    use crate::error::error_codes;

    enum Script {
        PassThrough,
        /// Binds the subject through the inner ledger, then reports a conflict
        /// as if a concurrent writer had won.
        WinnerAppearsThenConflict,
        AlwaysConflict,
    }

    struct ScriptedRepository {
        inner: InMemoryCounterLedger,
        script: Script,
        reserve_calls: AtomicU32,
    }

    impl ScriptedRepository {
        fn new(script: Script) -> Self {
            Self {
                inner: InMemoryCounterLedger::new_in_memory(),
                script,
                reserve_calls: AtomicU32::new(0),
            }
        }

        fn reserve_calls(&self) -> u32 {
            self.reserve_calls.load(Ordering::SeqCst)
        }
    }

    impl CounterRepository for ScriptedRepository {
        fn find_by_subject(
            &self,
            national_id_hash: &SubjectHash,
        ) -> Result<Option<CounterRecord>, StorageError> {
            self.inner.find_by_subject(national_id_hash)
        }

        fn reserve_and_bind(
            &self,
            codec: &CounterCodec,
            national_id_hash: &SubjectHash,
            bucket: &Bucket,
        ) -> Result<CounterRecord, StorageError> {
            self.reserve_calls.fetch_add(1, Ordering::SeqCst);
            let conflict = StorageError::Conflict {
                table: "counter_ledger.national_id_hash",
                key: national_id_hash.as_str().to_string(),
            };
            match self.script {
                Script::PassThrough => self.inner.reserve_and_bind(codec, national_id_hash, bucket),
                Script::WinnerAppearsThenConflict => {
                    self.inner.reserve_and_bind(codec, national_id_hash, bucket)?;
                    Err(conflict)
                }
                Script::AlwaysConflict => Err(conflict),
            }
        }

        fn max_sequence_in_bucket(&self, bucket: &Bucket) -> Result<Option<u32>, StorageError> {
            self.inner.max_sequence_in_bucket(bucket)
        }

        fn ledger_records(&self) -> Result<Vec<CounterRecord>, StorageError> {
            self.inner.ledger_records()
        }

        fn sequence_positions(&self) -> Result<BTreeMap<Bucket, u32>, StorageError> {
            self.inner.sequence_positions()
        }

        fn set_sequence_position(&self, bucket: &Bucket, next_seq: u32) -> Result<(), StorageError> {
            self.inner.set_sequence_position(bucket, next_seq)
        }
    }

    struct FailingMetricsSink;

    impl MetricsSink for FailingMetricsSink {
        fn record_event(&self, _event: &CounterEvent) -> Result<(), MetricsError> {
            Err(MetricsError::Backend("collector offline".to_string()))
        }

        fn record_sequence_position(
            &self,
            _year_code: &YearCode,
            _prefix: &str,
            _sequence: u32,
        ) -> Result<(), MetricsError> {
            Err(MetricsError::Backend("collector offline".to_string()))
        }
    }

    /// 2054-10-01, well after the 2054 cutover.
    fn clock_in_54() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2054, 10, 1, 8, 0, 0).unwrap()))
    }

    fn service_over(
        repo: Arc<dyn CounterRepository>,
        codec: CounterCodec,
        metrics: Arc<dyn MetricsSink>,
    ) -> CounterService {
        CounterService::new(
            repo,
            Arc::new(codec),
            Arc::new(CutoverYearProvider::mvp_v1().unwrap()),
            metrics,
            SubjectHasher::new("test-salt").unwrap(),
        )
        .with_clock(clock_in_54())
    }

    fn in_memory_service() -> (CounterService, Arc<InMemoryCounterLedger>, Arc<RecordingMetricsSink>) {
        let ledger = Arc::new(InMemoryCounterLedger::new_in_memory());
        let metrics = Arc::new(RecordingMetricsSink::new());
        let svc = service_over(
            ledger.clone(),
            CounterCodec::mvp_v1().unwrap(),
            metrics.clone(),
        );
        (svc, ledger, metrics)
    }

    #[test]
    fn at_service_01_first_allocation_matches_reference_example() {
        let (svc, _, metrics) = in_memory_service();
        let counter = svc.get_or_create("1234567890", 0, Some("54")).unwrap();
        assert_eq!(counter, "373540001");
        assert_eq!(metrics.count("generated"), 1);
        assert_eq!(metrics.sequence_position("54", "373"), Some(1));
    }

    #[test]
    fn at_service_02_idempotent_across_repeated_calls() {
        let (svc, ledger, metrics) = in_memory_service();
        let first = svc.get_or_create("1234567890", 1, None).unwrap();
        for _ in 0..5 {
            assert_eq!(svc.get_or_create("1234567890", 1, None).unwrap(), first);
        }
        assert_eq!(first, "357540001");
        assert_eq!(ledger.ledger_records().unwrap().len(), 1);
        assert_eq!(metrics.count("generated"), 1);
        assert_eq!(metrics.count("reuse"), 5);
        let next = svc.get_or_create("0987654321", 1, None).unwrap();
        assert_eq!(next, "357540002");
    }

    #[test]
    fn at_service_03_persian_digits_hash_to_same_subject() {
        let (svc, _, _) = in_memory_service();
        let ascii = svc.get_or_create("1234567890", 0, None).unwrap();
        let persian = svc.get_or_create("۱۲۳۴۵۶۷۸۹۰", 0, None).unwrap();
        assert_eq!(ascii, persian);
    }

    #[test]
    fn at_service_04_validation_fails_fast_without_side_effects() {
        let (svc, ledger, metrics) = in_memory_service();
        let cases: [(&str, i64, Option<&str>, &str); 4] = [
            ("12345", 0, None, error_codes::E_INVALID_NID),
            ("12345abcde", 0, None, error_codes::E_INVALID_NID),
            ("1234567890", 2, None, error_codes::E_INVALID_GENDER),
            ("1234567890", 0, Some("5"), error_codes::E_YEAR_CODE_INVALID),
        ];
        for (nid, gender, year, code) in cases {
            let err = svc.get_or_create(nid, gender, year).unwrap_err();
            assert_eq!(err.code(), code);
            assert!(err.is_validation());
        }
        assert!(ledger.ledger_records().unwrap().is_empty());
        assert!(ledger.sequence_positions().unwrap().is_empty());
        assert!(metrics.events().is_empty());
    }

    #[test]
    fn at_service_05_year_mismatch_rejected_for_new_subject_only() {
        let (svc, ledger, _) = in_memory_service();
        let err = svc.get_or_create("1234567890", 0, Some("53")).unwrap_err();
        assert!(matches!(err, CounterError::YearMismatch { .. }));
        assert_eq!(err.code(), error_codes::E_YEAR_MISMATCH);
        assert!(ledger.ledger_records().unwrap().is_empty());

        let bound = svc.get_or_create("1234567890", 0, None).unwrap();
        let reused = svc.allocate("1234567890", 0, Some("53")).unwrap();
        assert!(matches!(reused, AllocationOutcome::Reused(_)));
        assert_eq!(reused.counter(), bound);
    }

    #[test]
    fn at_service_06_conflict_resolved_by_reread() {
        let repo = Arc::new(ScriptedRepository::new(Script::WinnerAppearsThenConflict));
        let metrics = Arc::new(RecordingMetricsSink::new());
        let svc = service_over(repo.clone(), CounterCodec::mvp_v1().unwrap(), metrics.clone());

        let outcome = svc.allocate("1234567890", 0, None).unwrap();
        assert!(matches!(outcome, AllocationOutcome::ConflictResolved(_)));
        assert_eq!(outcome.counter(), "373540001");
        assert_eq!(repo.reserve_calls(), 1);
        assert_eq!(metrics.conflicts(ConflictKind::LedgerRace), 1);
        assert_eq!(metrics.count("generated"), 0);
    }

    #[test]
    fn at_service_07_unresolved_conflict_surfaces_after_bounded_retries() {
        let repo = Arc::new(ScriptedRepository::new(Script::AlwaysConflict));
        let metrics = Arc::new(RecordingMetricsSink::new());
        let svc = service_over(repo.clone(), CounterCodec::mvp_v1().unwrap(), metrics.clone())
            .with_conflict_retries(4);

        let err = svc.get_or_create("1234567890", 0, None).unwrap_err();
        assert!(matches!(err, CounterError::Conflict { attempts: 4 }));
        assert_eq!(err.code(), error_codes::E_DB_CONFLICT);
        assert_eq!(repo.reserve_calls(), 4);
        assert_eq!(metrics.conflicts(ConflictKind::Unresolved), 1);
        assert_eq!(metrics.events().len(), 1);
    }

    #[test]
    fn at_service_08_overflow_boundary_never_retried() {
        let repo = Arc::new(ScriptedRepository::new(Script::PassThrough));
        let metrics = Arc::new(RecordingMetricsSink::new());
        let codec = CounterCodec::new(PrefixMap::mvp_v1(), CounterFormat::new(4, 2).unwrap()).unwrap();
        let svc = service_over(repo.clone(), codec, metrics.clone());

        assert_eq!(svc.get_or_create("1000000001", 0, None).unwrap(), "373540001");
        assert_eq!(svc.get_or_create("1000000002", 0, None).unwrap(), "373540002");
        let calls_before = repo.reserve_calls();
        let before = LedgerSnapshot::capture(repo.as_ref()).unwrap();

        let err = svc.get_or_create("1000000003", 0, None).unwrap_err();
        assert!(matches!(err, CounterError::Exhausted { max_sequence: 2, .. }));
        assert_eq!(err.code(), error_codes::E_COUNTER_EXHAUSTED);
        assert_eq!(repo.reserve_calls(), calls_before + 1);
        assert_eq!(metrics.count("overflow"), 1);
        assert_eq!(LedgerSnapshot::capture(repo.as_ref()).unwrap(), before);

        // The other gender's bucket is unaffected.
        assert_eq!(svc.get_or_create("1000000003", 1, None).unwrap(), "357540001");
    }

    #[test]
    fn at_service_09_metrics_failure_never_aborts_allocation() {
        let ledger = Arc::new(InMemoryCounterLedger::new_in_memory());
        let svc = service_over(
            ledger.clone(),
            CounterCodec::mvp_v1().unwrap(),
            Arc::new(FailingMetricsSink),
        );
        assert_eq!(svc.get_or_create("1234567890", 0, None).unwrap(), "373540001");
        assert_eq!(svc.get_or_create("1234567890", 0, None).unwrap(), "373540001");
        assert_eq!(ledger.ledger_records().unwrap().len(), 1);
    }

    fn tally(outcomes: &[AllocationOutcome]) -> (usize, usize, usize) {
        let generated = outcomes
            .iter()
            .filter(|o| matches!(o, AllocationOutcome::Generated(_)))
            .count();
        let reused = outcomes
            .iter()
            .filter(|o| matches!(o, AllocationOutcome::Reused(_)))
            .count();
        let resolved = outcomes
            .iter()
            .filter(|o| matches!(o, AllocationOutcome::ConflictResolved(_)))
            .count();
        (generated, reused, resolved)
    }

    #[test]
    fn at_service_10_concurrent_callers_converge_in_memory() {
        let (svc, ledger, metrics) = in_memory_service();
        let outcomes: Vec<AllocationOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|_| scope.spawn(|| svc.allocate("1234567890", 0, None).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let distinct: BTreeSet<_> = outcomes.iter().map(|o| o.counter().to_string()).collect();
        assert_eq!(distinct.len(), 1);
        let (generated, reused, resolved) = tally(&outcomes);
        assert_eq!(generated, 1);
        assert_eq!(reused + resolved, 9);
        assert_eq!(ledger.ledger_records().unwrap().len(), 1);
        assert_eq!(metrics.count("generated"), 1);
    }

    #[test]
    fn at_service_11_concurrent_processes_converge_on_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        SqliteCounterLedger::open(&path).unwrap();

        let outcomes: Vec<AllocationOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let path = path.as_path();
                    scope.spawn(move || {
                        // One connection per worker, as separate processes would have.
                        let ledger = Arc::new(SqliteCounterLedger::open(path).unwrap());
                        let svc = service_over(
                            ledger,
                            CounterCodec::mvp_v1().unwrap(),
                            Arc::new(RecordingMetricsSink::new()),
                        );
                        svc.allocate("1234567890", 1, None).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let distinct: BTreeSet<_> = outcomes.iter().map(|o| o.counter().to_string()).collect();
        assert_eq!(distinct.len(), 1);
        assert_eq!(distinct.iter().next().map(String::as_str), Some("357540001"));
        let (generated, reused, resolved) = tally(&outcomes);
        assert_eq!(generated, 1);
        assert_eq!(reused + resolved, 9);
    }

    #[test]
    fn at_service_12_gender_count_is_validated_against_prefix_map() {
        let (svc, _, _) = in_memory_service();
        let err = svc.get_or_create("1234567890", -1, None).unwrap_err();
        assert_eq!(err.code(), error_codes::E_INVALID_GENDER);
        assert_eq!(
            svc.allocate("1234567890", 1, None).unwrap().record().gender,
            Gender::Male
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn at_service_13_distinct_subjects_get_distinct_counters(
            subjects in prop::collection::btree_set("[0-9]{10}", 1..40),
            genders in prop::collection::vec(0i64..=1, 40),
        ) {
            let (svc, _, _) = in_memory_service();
            let mut seen = BTreeMap::new();
            for (nid, gender) in subjects.iter().zip(genders.iter()) {
                let counter = svc.get_or_create(nid, *gender, None).unwrap();
                prop_assert!(svc.codec().is_well_formed(&counter));
                prop_assert!(seen.insert(counter.clone(), nid.clone()).is_none());
                prop_assert_eq!(svc.get_or_create(nid, *gender, None).unwrap(), counter);
            }
        }
    }
}
