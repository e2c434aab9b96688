#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use counter_contracts::counter::{Bucket, CounterCodec, CounterRecord, SubjectHash};

use crate::ledger::StorageError;

/// Persistence contract for the counter ledger.
///
/// Every method is atomic against the backing store. Implementations must be
/// shareable across threads; cross-process safety is the store's concern.
pub trait CounterRepository: Send + Sync {
    fn find_by_subject(
        &self,
        national_id_hash: &SubjectHash,
    ) -> Result<Option<CounterRecord>, StorageError>;

    /// Reserves the next free sequence in `bucket` and binds it to the subject
    /// in one transaction.
    ///
    /// Fails with [`StorageError::Overflow`] before any insert once the bucket
    /// maximum is reached, and with [`StorageError::Conflict`] if the subject
    /// is already bound.
    fn reserve_and_bind(
        &self,
        codec: &CounterCodec,
        national_id_hash: &SubjectHash,
        bucket: &Bucket,
    ) -> Result<CounterRecord, StorageError>;

    fn max_sequence_in_bucket(&self, bucket: &Bucket) -> Result<Option<u32>, StorageError>;

    fn ledger_records(&self) -> Result<Vec<CounterRecord>, StorageError>;

    /// Current `next_seq` per bucket.
    fn sequence_positions(&self) -> Result<BTreeMap<Bucket, u32>, StorageError>;

    fn set_sequence_position(&self, bucket: &Bucket, next_seq: u32) -> Result<(), StorageError>;
}

impl<R> CounterRepository for Arc<R>
where
    R: CounterRepository + ?Sized,
{
    fn find_by_subject(
        &self,
        national_id_hash: &SubjectHash,
    ) -> Result<Option<CounterRecord>, StorageError> {
        (**self).find_by_subject(national_id_hash)
    }

    fn reserve_and_bind(
        &self,
        codec: &CounterCodec,
        national_id_hash: &SubjectHash,
        bucket: &Bucket,
    ) -> Result<CounterRecord, StorageError> {
        (**self).reserve_and_bind(codec, national_id_hash, bucket)
    }

    fn max_sequence_in_bucket(&self, bucket: &Bucket) -> Result<Option<u32>, StorageError> {
        (**self).max_sequence_in_bucket(bucket)
    }

    fn ledger_records(&self) -> Result<Vec<CounterRecord>, StorageError> {
        (**self).ledger_records()
    }

    fn sequence_positions(&self) -> Result<BTreeMap<Bucket, u32>, StorageError> {
        (**self).sequence_positions()
    }

    fn set_sequence_position(&self, bucket: &Bucket, next_seq: u32) -> Result<(), StorageError> {
        (**self).set_sequence_position(bucket, next_seq)
    }
}

/// Full copy of ledger state, ordered for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub records: Vec<CounterRecord>,
    pub sequences: BTreeMap<Bucket, u32>,
}

impl LedgerSnapshot {
    pub fn capture(repo: &dyn CounterRepository) -> Result<Self, StorageError> {
        let mut records = repo.ledger_records()?;
        records.sort_by(|a, b| a.national_id_hash.cmp(&b.national_id_hash));
        Ok(Self {
            records,
            sequences: repo.sequence_positions()?,
        })
    }
}
