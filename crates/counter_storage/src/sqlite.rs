//! `SQLite`-backed counter ledger.
//!
//! Reservation runs inside a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front. Independent processes opening the same file
//! therefore serialize on reservation without any in-process coordination.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use counter_contracts::counter::{
    Bucket, CounterCodec, CounterRecord, Gender, SubjectHash, YearCode, COUNTER_CONTRACT_VERSION,
};
use counter_contracts::UnixTimeMs;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};

use crate::ledger::{now_unix_ms, StorageError};
use crate::repo::CounterRepository;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_LEDGER_COLUMNS: &str =
    "SELECT national_id_hash, gender, year_code, sequence, counter, created_at_ms FROM counter_ledger";

struct RawLedgerRow {
    national_id_hash: String,
    gender: i64,
    year_code: String,
    sequence: i64,
    counter: String,
    created_at_ms: i64,
}

impl RawLedgerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            national_id_hash: row.get(0)?,
            gender: row.get(1)?,
            year_code: row.get(2)?,
            sequence: row.get(3)?,
            counter: row.get(4)?,
            created_at_ms: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<CounterRecord, StorageError> {
        let corrupt = |details: String| StorageError::CorruptRow {
            table: "counter_ledger",
            details,
        };
        let sequence = u32::try_from(self.sequence)
            .map_err(|_| corrupt(format!("sequence out of range: {}", self.sequence)))?;
        Ok(CounterRecord {
            schema_version: COUNTER_CONTRACT_VERSION,
            national_id_hash: SubjectHash::new(self.national_id_hash)?,
            gender: Gender::from_code(self.gender)?,
            year_code: YearCode::new(&self.year_code)?,
            sequence,
            counter: self.counter,
            created_at: UnixTimeMs(u64::try_from(self.created_at_ms).unwrap_or(0)),
        })
    }
}

fn bucket_from_columns(gender: i64, year_code: &str) -> Result<Bucket, StorageError> {
    Ok(Bucket::new(Gender::from_code(gender)?, YearCode::new(year_code)?))
}

fn unix_ms_i64(t: UnixTimeMs) -> i64 {
    i64::try_from(t.0).unwrap_or(i64::MAX)
}

fn subject_is_bound(
    conn: &Connection,
    national_id_hash: &SubjectHash,
) -> Result<bool, StorageError> {
    let bound: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM counter_ledger WHERE national_id_hash = ?1",
            params![national_id_hash.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bound.is_some())
}

fn subject_conflict(national_id_hash: &SubjectHash) -> StorageError {
    StorageError::Conflict {
        table: "counter_ledger.national_id_hash",
        key: national_id_hash.as_str().to_string(),
    }
}

/// Maps a failed ledger insert onto the contract's error kinds. SQLite may
/// name any of the violated UNIQUE constraints, so a bound subject is
/// detected by lookup rather than from the message.
fn classify_insert_error(
    conn: &Connection,
    err: rusqlite::Error,
    national_id_hash: &SubjectHash,
) -> StorageError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            return match subject_is_bound(conn, national_id_hash) {
                Ok(true) => subject_conflict(national_id_hash),
                Ok(false) => StorageError::DuplicateKey {
                    table: "counter_ledger",
                    key: message.clone().unwrap_or_default(),
                },
                Err(lookup) => lookup,
            };
        }
    }
    StorageError::Database(err)
}

pub struct SqliteCounterLedger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteCounterLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCounterLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteCounterLedger {
    /// Opens or creates a ledger file and applies the schema idempotently.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;
        tracing::debug!(path = %path.display(), "counter ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Inserts a pre-existing row verbatim (historical import). Uniqueness is
    /// still enforced; the sequence table is left untouched.
    pub fn insert_historical_row(&self, record: &CounterRecord) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if subject_is_bound(&tx, &record.national_id_hash)? {
            return Err(subject_conflict(&record.national_id_hash));
        }
        tx.execute(
            "INSERT INTO counter_ledger (national_id_hash, gender, year_code, sequence, counter, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.national_id_hash.as_str(),
                i64::from(record.gender.code()),
                record.year_code.as_str(),
                i64::from(record.sequence),
                record.counter,
                unix_ms_i64(record.created_at),
            ],
        )
        .map_err(|e| classify_insert_error(&tx, e, &record.national_id_hash))?;
        tx.commit()?;
        Ok(())
    }
}

impl CounterRepository for SqliteCounterLedger {
    fn find_by_subject(
        &self,
        national_id_hash: &SubjectHash,
    ) -> Result<Option<CounterRecord>, StorageError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_LEDGER_COLUMNS} WHERE national_id_hash = ?1"),
                params![national_id_hash.as_str()],
                RawLedgerRow::from_row,
            )
            .optional()?;
        raw.map(RawLedgerRow::into_record).transpose()
    }

    fn reserve_and_bind(
        &self,
        codec: &CounterCodec,
        national_id_hash: &SubjectHash,
        bucket: &Bucket,
    ) -> Result<CounterRecord, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let gender = i64::from(bucket.gender.code());
        let year_code = bucket.year_code.as_str();

        let already_bound: Option<String> = tx
            .query_row(
                "SELECT counter FROM counter_ledger WHERE national_id_hash = ?1",
                params![national_id_hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if already_bound.is_some() {
            return Err(subject_conflict(national_id_hash));
        }

        let stored_next: Option<i64> = tx
            .query_row(
                "SELECT next_seq FROM counter_sequences WHERE gender = ?1 AND year_code = ?2",
                params![gender, year_code],
                |row| row.get(0),
            )
            .optional()?;
        let ledger_max: Option<i64> = tx.query_row(
            "SELECT MAX(sequence) FROM counter_ledger WHERE gender = ?1 AND year_code = ?2",
            params![gender, year_code],
            |row| row.get(0),
        )?;
        let next = stored_next
            .unwrap_or(1)
            .max(ledger_max.unwrap_or(0).saturating_add(1));

        let max_sequence = codec.format().max_sequence;
        if next > i64::from(max_sequence) {
            return Err(StorageError::Overflow {
                bucket: bucket.clone(),
                max_sequence,
            });
        }
        let sequence = u32::try_from(next).map_err(|_| StorageError::CorruptRow {
            table: "counter_sequences",
            details: format!("next_seq out of range: {next}"),
        })?;

        let record = CounterRecord::v1(
            codec,
            national_id_hash.clone(),
            bucket.clone(),
            sequence,
            now_unix_ms(),
        )?;
        tx.execute(
            "INSERT INTO counter_ledger (national_id_hash, gender, year_code, sequence, counter, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.national_id_hash.as_str(),
                gender,
                year_code,
                next,
                record.counter,
                unix_ms_i64(record.created_at),
            ],
        )
        .map_err(|e| classify_insert_error(&tx, e, national_id_hash))?;
        tx.execute(
            "INSERT INTO counter_sequences (gender, year_code, next_seq, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(gender, year_code)
             DO UPDATE SET next_seq = excluded.next_seq, updated_at_ms = excluded.updated_at_ms",
            params![gender, year_code, next + 1, unix_ms_i64(record.created_at)],
        )?;
        tx.commit()?;

        tracing::debug!(bucket = %bucket, sequence, "sqlite sequence reserved");
        Ok(record)
    }

    fn max_sequence_in_bucket(&self, bucket: &Bucket) -> Result<Option<u32>, StorageError> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM counter_ledger WHERE gender = ?1 AND year_code = ?2",
            params![i64::from(bucket.gender.code()), bucket.year_code.as_str()],
            |row| row.get(0),
        )?;
        max.map(|m| {
            u32::try_from(m).map_err(|_| StorageError::CorruptRow {
                table: "counter_ledger",
                details: format!("sequence out of range: {m}"),
            })
        })
        .transpose()
    }

    fn ledger_records(&self) -> Result<Vec<CounterRecord>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_LEDGER_COLUMNS} ORDER BY rowid ASC"))?;
        let raws = stmt
            .query_map([], RawLedgerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawLedgerRow::into_record).collect()
    }

    fn sequence_positions(&self) -> Result<BTreeMap<Bucket, u32>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT gender, year_code, next_seq FROM counter_sequences")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = BTreeMap::new();
        for (gender, year_code, next_seq) in rows {
            let next_seq = u32::try_from(next_seq).map_err(|_| StorageError::CorruptRow {
                table: "counter_sequences",
                details: format!("next_seq out of range: {next_seq}"),
            })?;
            out.insert(bucket_from_columns(gender, &year_code)?, next_seq);
        }
        Ok(out)
    }

    fn set_sequence_position(&self, bucket: &Bucket, next_seq: u32) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO counter_sequences (gender, year_code, next_seq, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(gender, year_code)
             DO UPDATE SET next_seq = excluded.next_seq, updated_at_ms = excluded.updated_at_ms",
            params![
                i64::from(bucket.gender.code()),
                bucket.year_code.as_str(),
                i64::from(next_seq),
                unix_ms_i64(now_unix_ms()),
            ],
        )?;
        Ok(())
    }
}
