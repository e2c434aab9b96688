//! Offline reconciliation of legacy student rows against the ledger.
//!
//! `plan` only reads. `apply` commits a plan through the same allocation path
//! live traffic uses, so a dry run and an apply run of the same input agree on
//! every row that does not race with concurrent traffic.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io;

use counter_contracts::counter::{Bucket, CounterRecord, Gender, NationalId, SubjectHash};
use counter_engines::metrics::{CounterEvent, MismatchKind};
use counter_storage::StorageError;
use serde::{Deserialize, Serialize};

use crate::error::error_codes;
use crate::service::{AllocationOutcome, CounterService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRecord {
    pub national_id: String,
    pub stated_gender: String,
    #[serde(default)]
    pub stated_counter: Option<String>,
}

impl BackfillRecord {
    pub fn new(national_id: &str, stated_gender: &str, stated_counter: Option<&str>) -> Self {
        Self {
            national_id: national_id.to_string(),
            stated_gender: stated_gender.to_string(),
            stated_counter: stated_counter.map(str::to_string),
        }
    }

    fn stated_counter(&self) -> Option<&str> {
        self.stated_counter
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finding {
    Ok,
    GenderMismatch,
    SequenceDerived,
    Missing,
    Invalid,
    Failed,
    SequenceDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Bound,
    Realigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRow {
    pub national_id: String,
    pub stated_gender: String,
    pub stated_counter: Option<String>,
    pub finding: Finding,
    pub action: Action,
    pub counter: Option<String>,
    pub code: Option<String>,
    pub details: Option<String>,
}

impl BackfillRow {
    fn for_record(record: &BackfillRecord, finding: Finding) -> Self {
        Self {
            national_id: record.national_id.trim().to_string(),
            stated_gender: record.stated_gender.trim().to_string(),
            stated_counter: record.stated_counter().map(str::to_string),
            finding,
            action: Action::None,
            counter: None,
            code: None,
            details: None,
        }
    }

    fn for_bucket(bucket: &Bucket, finding: Finding, details: String) -> Self {
        Self {
            national_id: String::new(),
            stated_gender: bucket.gender.code().to_string(),
            stated_counter: None,
            finding,
            action: Action::None,
            counter: None,
            code: None,
            details: Some(details),
        }
    }

    fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    fn with_counter(mut self, counter: impl Into<String>) -> Self {
        self.counter = Some(counter.into());
        self
    }

    fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub rows: Vec<BackfillRow>,
}

impl BackfillReport {
    /// Rows that changed, or would change, the ledger.
    pub fn actions(&self) -> Vec<&BackfillRow> {
        self.rows
            .iter()
            .filter(|r| r.action != Action::None)
            .collect()
    }

    pub fn count(&self, finding: Finding) -> usize {
        self.rows.iter().filter(|r| r.finding == finding).count()
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut out = csv::Writer::from_writer(writer);
        for row in &self.rows {
            out.serialize(row)?;
        }
        out.flush()?;
        Ok(())
    }
}

pub fn read_records<R: io::Read>(reader: R) -> Result<Vec<BackfillRecord>, csv::Error> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
        .deserialize()
        .collect()
}

#[derive(Debug, Clone)]
enum PlannedEntry {
    Invalid {
        record: BackfillRecord,
        code: Option<&'static str>,
        details: String,
    },
    GenderMismatch {
        record: BackfillRecord,
        expected_prefix: String,
        found_prefix: String,
    },
    Bound {
        record: BackfillRecord,
        existing: CounterRecord,
    },
    Unbound {
        record: BackfillRecord,
        national_id: NationalId,
        gender: Gender,
        planned_counter: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct PlannedRealignment {
    bucket: Bucket,
    stored: Option<u32>,
    expected: u32,
}

/// Result of the read-only planning phase.
#[derive(Debug, Clone)]
pub struct BackfillPlan {
    entries: Vec<PlannedEntry>,
    realignments: Vec<PlannedRealignment>,
}

fn drift_details(r: &PlannedRealignment) -> String {
    match r.stored {
        Some(stored) => format!("bucket {}: next_seq {stored}, expected {}", r.bucket, r.expected),
        None => format!("bucket {}: next_seq missing, expected {}", r.bucket, r.expected),
    }
}

fn mismatch_details(expected_prefix: &str, found_prefix: &str) -> String {
    format!("expected prefix {expected_prefix}, found {found_prefix}")
}

impl BackfillPlan {
    /// Report for the plan without committing it.
    pub fn dry_run_report(&self) -> BackfillReport {
        let mut rows: Vec<BackfillRow> = self
            .entries
            .iter()
            .map(|entry| match entry {
                PlannedEntry::Invalid {
                    record,
                    code,
                    details,
                } => invalid_row(record, *code, details),
                PlannedEntry::GenderMismatch {
                    record,
                    expected_prefix,
                    found_prefix,
                } => BackfillRow::for_record(record, Finding::GenderMismatch)
                    .with_details(mismatch_details(expected_prefix, found_prefix)),
                PlannedEntry::Bound { record, existing } => bound_row(record, existing),
                PlannedEntry::Unbound {
                    record,
                    planned_counter,
                    ..
                } => {
                    let row = BackfillRow::for_record(record, Finding::Missing);
                    match planned_counter {
                        Some(counter) => row.with_counter(counter),
                        None => row
                            .with_code(error_codes::E_COUNTER_EXHAUSTED)
                            .with_details("bucket exhausted"),
                    }
                }
            })
            .collect();
        rows.extend(self.realignments.iter().map(|r| {
            BackfillRow::for_bucket(&r.bucket, Finding::SequenceDrift, drift_details(r))
        }));
        BackfillReport {
            dry_run: true,
            rows,
        }
    }
}

/// The ledger counter is authoritative; a differing stated counter is noted.
fn bound_row(record: &BackfillRecord, existing: &CounterRecord) -> BackfillRow {
    let row = BackfillRow::for_record(record, Finding::Ok).with_counter(&existing.counter);
    match record.stated_counter() {
        Some(stated) if stated != existing.counter => {
            row.with_details(format!("stated counter {stated} differs from ledger"))
        }
        _ => row,
    }
}

fn invalid_row(record: &BackfillRecord, code: Option<&str>, details: &str) -> BackfillRow {
    let row = BackfillRow::for_record(record, Finding::Invalid).with_details(details);
    match code {
        Some(code) => row.with_code(code),
        None => row,
    }
}

pub struct BackfillReconciler<'a> {
    service: &'a CounterService,
}

impl<'a> BackfillReconciler<'a> {
    pub fn new(service: &'a CounterService) -> Self {
        Self { service }
    }

    pub fn run(
        &self,
        records: &[BackfillRecord],
        dry_run: bool,
    ) -> Result<BackfillReport, StorageError> {
        let plan = self.plan(records)?;
        if dry_run {
            Ok(plan.dry_run_report())
        } else {
            Ok(self.apply(plan))
        }
    }

    /// Read-only pass over the input and the ledger.
    pub fn plan(&self, records: &[BackfillRecord]) -> Result<BackfillPlan, StorageError> {
        let repo = self.service.repository();
        let codec = self.service.codec();
        let year_code = self.service.current_year_code();

        let realignments = self.plan_realignments()?;
        // Positions as `apply` will see them once realignment has run.
        let mut positions = repo.sequence_positions()?;
        for r in &realignments {
            positions.insert(r.bucket.clone(), r.expected);
        }

        let mut next_in_bucket: BTreeMap<Bucket, u32> = BTreeMap::new();
        let mut planned_subjects: BTreeMap<SubjectHash, Option<String>> = BTreeMap::new();
        let mut entries = Vec::with_capacity(records.len());

        for record in records {
            let national_id = match NationalId::new(&record.national_id) {
                Ok(v) => v,
                Err(e) => {
                    entries.push(PlannedEntry::Invalid {
                        record: record.clone(),
                        code: Some(error_codes::E_INVALID_NID),
                        details: e.to_string(),
                    });
                    continue;
                }
            };
            let gender = match Gender::parse_alias(&record.stated_gender) {
                Ok(v) => v,
                Err(e) => {
                    entries.push(PlannedEntry::Invalid {
                        record: record.clone(),
                        code: Some(error_codes::E_INVALID_GENDER),
                        details: e.to_string(),
                    });
                    continue;
                }
            };
            if let Some(stated) = record.stated_counter() {
                if !codec.is_well_formed(stated) {
                    entries.push(PlannedEntry::Invalid {
                        record: record.clone(),
                        code: None,
                        details: "stated counter is malformed".to_string(),
                    });
                    continue;
                }
            }

            let national_id_hash = self.service.hasher().hash(&national_id)?;
            let existing = repo.find_by_subject(&national_id_hash)?;
            let expected_prefix = codec.prefixes().prefix_for(gender);
            let disagreeing = record
                .stated_counter()
                .into_iter()
                .chain(existing.as_ref().map(|r| r.counter.as_str()))
                .filter_map(|c| codec.prefix_of(c))
                .find(|prefix| *prefix != expected_prefix);
            if let Some(found_prefix) = disagreeing {
                self.count_mismatch();
                entries.push(PlannedEntry::GenderMismatch {
                    record: record.clone(),
                    expected_prefix: expected_prefix.to_string(),
                    found_prefix: found_prefix.to_string(),
                });
                continue;
            }

            if let Some(existing) = existing {
                entries.push(PlannedEntry::Bound {
                    record: record.clone(),
                    existing,
                });
                continue;
            }

            let planned_counter = match planned_subjects.get(&national_id_hash) {
                Some(already) => already.clone(),
                None => {
                    let bucket = Bucket::new(gender, year_code.clone());
                    let next = match next_in_bucket.get(&bucket) {
                        Some(n) => *n,
                        None => {
                            let after_ledger = repo
                                .max_sequence_in_bucket(&bucket)?
                                .map_or(1, |m| m.saturating_add(1));
                            positions.get(&bucket).copied().unwrap_or(1).max(after_ledger)
                        }
                    };
                    next_in_bucket.insert(bucket, next.saturating_add(1));
                    let counter = codec.encode(gender, &year_code, next).ok();
                    planned_subjects.insert(national_id_hash, counter.clone());
                    counter
                }
            };
            entries.push(PlannedEntry::Unbound {
                record: record.clone(),
                national_id,
                gender,
                planned_counter,
            });
        }

        Ok(BackfillPlan {
            entries,
            realignments,
        })
    }

    fn plan_realignments(&self) -> Result<Vec<PlannedRealignment>, StorageError> {
        let repo = self.service.repository();
        let mut ledger_max: BTreeMap<Bucket, u32> = BTreeMap::new();
        for record in repo.ledger_records()? {
            let max = ledger_max.entry(record.bucket()).or_insert(0);
            *max = (*max).max(record.sequence);
        }
        let positions = repo.sequence_positions()?;
        Ok(ledger_max
            .into_iter()
            .filter_map(|(bucket, max)| {
                let expected = max.saturating_add(1);
                let stored = positions.get(&bucket).copied();
                (stored != Some(expected)).then_some(PlannedRealignment {
                    bucket,
                    stored,
                    expected,
                })
            })
            .collect())
    }

    /// Commits a plan. Realignment runs first so new bindings continue from
    /// the ledger maximum.
    pub fn apply(&self, plan: BackfillPlan) -> BackfillReport {
        let repo = self.service.repository();
        let drift_rows: Vec<BackfillRow> = plan
            .realignments
            .iter()
            .map(|r| {
                let row = BackfillRow::for_bucket(&r.bucket, Finding::SequenceDrift, drift_details(r));
                match repo.set_sequence_position(&r.bucket, r.expected) {
                    Ok(()) => {
                        tracing::info!(
                            event = "counter_sequence_realigned",
                            bucket = %r.bucket,
                            next_seq = r.expected,
                        );
                        row.with_action(Action::Realigned)
                    }
                    Err(e) => BackfillRow::for_bucket(&r.bucket, Finding::Failed, e.to_string())
                        .with_code(error_codes::E_DB_FAILURE),
                }
            })
            .collect();

        let mut rows: Vec<BackfillRow> = plan
            .entries
            .into_iter()
            .map(|entry| match entry {
                PlannedEntry::Invalid {
                    record,
                    code,
                    details,
                } => invalid_row(&record, code, &details),
                PlannedEntry::GenderMismatch {
                    record,
                    expected_prefix,
                    found_prefix,
                } => BackfillRow::for_record(&record, Finding::GenderMismatch)
                    .with_details(mismatch_details(&expected_prefix, &found_prefix)),
                PlannedEntry::Bound { record, existing } => bound_row(&record, &existing),
                PlannedEntry::Unbound {
                    record,
                    national_id,
                    gender,
                    ..
                } => self.bind(&record, &national_id, gender),
            })
            .collect();
        rows.extend(drift_rows);

        BackfillReport {
            dry_run: false,
            rows,
        }
    }

    fn bind(&self, record: &BackfillRecord, national_id: &NationalId, gender: Gender) -> BackfillRow {
        match self
            .service
            .allocate(national_id.as_str(), i64::from(gender.code()), None)
        {
            Ok(AllocationOutcome::Generated(r)) => {
                BackfillRow::for_record(record, Finding::SequenceDerived)
                    .with_action(Action::Bound)
                    .with_counter(r.counter)
            }
            Ok(other) => BackfillRow::for_record(record, Finding::Ok)
                .with_counter(other.into_record().counter),
            Err(e) => BackfillRow::for_record(record, Finding::Failed)
                .with_code(e.code())
                .with_details(e.to_string()),
        }
    }

    fn count_mismatch(&self) {
        let event = CounterEvent::BackfillMismatch {
            kind: MismatchKind::GenderPrefix,
        };
        if let Err(e) = self.service.metrics().record_event(&event) {
            tracing::warn!(metric = event.name(), error = %e, "metrics emission failed");
        }
    }
}
