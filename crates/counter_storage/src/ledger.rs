#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use counter_contracts::counter::{Bucket, CounterCodec, CounterRecord, SubjectHash};
use counter_contracts::{ContractViolation, UnixTimeMs};
use thiserror::Error;

use crate::repo::CounterRepository;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Another writer already bound this subject.
    #[error("subject already bound in {table}: {key}")]
    Conflict { table: &'static str, key: String },

    #[error("sequence space exhausted for bucket {bucket} (max {max_sequence})")]
    Overflow { bucket: Bucket, max_sequence: u32 },

    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },

    #[error("append-only violation on {table}")]
    AppendOnlyViolation { table: &'static str },

    #[error("corrupt row in {table}: {details}")]
    CorruptRow { table: &'static str, details: String },

    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("ledger lock poisoned")]
    LockPoisoned,
}

pub(crate) fn now_unix_ms() -> UnixTimeMs {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    UnixTimeMs(ms)
}

#[derive(Debug, Default)]
struct LedgerTables {
    rows: Vec<CounterRecord>,
    by_subject: BTreeMap<SubjectHash, usize>,
    by_counter: BTreeMap<String, usize>,
    by_bucket_sequence: BTreeMap<(Bucket, u32), usize>,
    next_seq: BTreeMap<Bucket, u32>,
}

impl LedgerTables {
    fn max_sequence(&self, bucket: &Bucket) -> Option<u32> {
        self.by_bucket_sequence
            .range((bucket.clone(), 0)..=(bucket.clone(), u32::MAX))
            .next_back()
            .map(|((_, seq), _)| *seq)
    }

    fn check_unique(&self, record: &CounterRecord) -> Result<(), StorageError> {
        if self.by_subject.contains_key(&record.national_id_hash) {
            return Err(StorageError::Conflict {
                table: "counter_ledger.national_id_hash",
                key: record.national_id_hash.as_str().to_string(),
            });
        }
        if self.by_counter.contains_key(&record.counter) {
            return Err(StorageError::DuplicateKey {
                table: "counter_ledger.counter",
                key: record.counter.clone(),
            });
        }
        if self
            .by_bucket_sequence
            .contains_key(&(record.bucket(), record.sequence))
        {
            return Err(StorageError::DuplicateKey {
                table: "counter_ledger.gender_year_code_sequence",
                key: format!("{}:{}", record.bucket(), record.sequence),
            });
        }
        Ok(())
    }

    fn insert(&mut self, record: CounterRecord) {
        let idx = self.rows.len();
        self.by_subject.insert(record.national_id_hash.clone(), idx);
        self.by_counter.insert(record.counter.clone(), idx);
        self.by_bucket_sequence
            .insert((record.bucket(), record.sequence), idx);
        self.rows.push(record);
    }
}

/// Process-local ledger with the same constraint semantics as the SQLite
/// schema. One mutex covers all tables, so each call is a transaction.
#[derive(Debug, Default)]
pub struct InMemoryCounterLedger {
    tables: Mutex<LedgerTables>,
}

impl InMemoryCounterLedger {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerTables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Inserts a pre-existing row verbatim (historical import). Uniqueness is
    /// still enforced; the sequence table is left untouched.
    pub fn insert_historical_row(&self, record: CounterRecord) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        tables.check_unique(&record)?;
        tables.insert(record);
        Ok(())
    }

    pub fn attempt_overwrite_counter_row(
        &self,
        _national_id_hash: &SubjectHash,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "counter_ledger",
        })
    }
}

impl CounterRepository for InMemoryCounterLedger {
    fn find_by_subject(
        &self,
        national_id_hash: &SubjectHash,
    ) -> Result<Option<CounterRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .by_subject
            .get(national_id_hash)
            .and_then(|idx| tables.rows.get(*idx))
            .cloned())
    }

    fn reserve_and_bind(
        &self,
        codec: &CounterCodec,
        national_id_hash: &SubjectHash,
        bucket: &Bucket,
    ) -> Result<CounterRecord, StorageError> {
        let mut tables = self.lock()?;
        if tables.by_subject.contains_key(national_id_hash) {
            return Err(StorageError::Conflict {
                table: "counter_ledger.national_id_hash",
                key: national_id_hash.as_str().to_string(),
            });
        }

        let stored_next = tables.next_seq.get(bucket).copied().unwrap_or(1);
        let ledger_next = tables
            .max_sequence(bucket)
            .map(|m| m.saturating_add(1))
            .unwrap_or(1);
        let sequence = stored_next.max(ledger_next);
        let max_sequence = codec.format().max_sequence;
        if sequence > max_sequence {
            return Err(StorageError::Overflow {
                bucket: bucket.clone(),
                max_sequence,
            });
        }

        let record = CounterRecord::v1(
            codec,
            national_id_hash.clone(),
            bucket.clone(),
            sequence,
            now_unix_ms(),
        )?;
        tables.check_unique(&record)?;
        tables.insert(record.clone());
        tables
            .next_seq
            .insert(bucket.clone(), sequence.saturating_add(1));
        tracing::debug!(bucket = %bucket, sequence, "in-memory sequence reserved");
        Ok(record)
    }

    fn max_sequence_in_bucket(&self, bucket: &Bucket) -> Result<Option<u32>, StorageError> {
        Ok(self.lock()?.max_sequence(bucket))
    }

    fn ledger_records(&self) -> Result<Vec<CounterRecord>, StorageError> {
        Ok(self.lock()?.rows.clone())
    }

    fn sequence_positions(&self) -> Result<BTreeMap<Bucket, u32>, StorageError> {
        Ok(self.lock()?.next_seq.clone())
    }

    fn set_sequence_position(&self, bucket: &Bucket, next_seq: u32) -> Result<(), StorageError> {
        if next_seq == 0 {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "counter_sequences.next_seq",
                    reason: "must be >= 1",
                },
            ));
        }
        self.lock()?.next_seq.insert(bucket.clone(), next_seq);
        Ok(())
    }
}
