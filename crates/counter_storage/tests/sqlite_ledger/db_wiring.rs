#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::Path;

use counter_contracts::counter::{
    Bucket, CounterCodec, CounterFormat, CounterRecord, Gender, PrefixMap, SubjectHash, YearCode,
};
use counter_contracts::UnixTimeMs;
use counter_storage::{CounterRepository, LedgerSnapshot, SqliteCounterLedger, StorageError};

fn subject(n: u64) -> SubjectHash {
    SubjectHash::new(format!("{n:064x}")).unwrap()
}

fn bucket(gender: Gender, year: &str) -> Bucket {
    Bucket::new(gender, YearCode::new(year).unwrap())
}

fn codec() -> CounterCodec {
    CounterCodec::mvp_v1().unwrap()
}

fn ledger_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("counter_ledger.db")
}

#[test]
fn at_sqlite_db_01_reserve_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = ledger_path(&dir);
    let b = bucket(Gender::Female, "54");
    {
        let s = SqliteCounterLedger::open(&path).unwrap();
        let r = s.reserve_and_bind(&codec(), &subject(1), &b).unwrap();
        assert_eq!(r.counter, "373540001");
    }

    let reopened = SqliteCounterLedger::open(&path).unwrap();
    let found = reopened.find_by_subject(&subject(1)).unwrap().unwrap();
    assert_eq!(found.counter, "373540001");
    assert_eq!(found.sequence, 1);
    assert_eq!(reopened.sequence_positions().unwrap().get(&b), Some(&2));
    let next = reopened.reserve_and_bind(&codec(), &subject(2), &b).unwrap();
    assert_eq!(next.counter, "373540002");
}

#[test]
fn at_sqlite_db_02_conflict_and_overflow_are_distinct() {
    let s = SqliteCounterLedger::in_memory().unwrap();
    let small = CounterCodec::new(PrefixMap::mvp_v1(), CounterFormat::new(4, 1).unwrap()).unwrap();
    let b = bucket(Gender::Male, "54");
    s.reserve_and_bind(&small, &subject(1), &b).unwrap();

    assert!(matches!(
        s.reserve_and_bind(&small, &subject(1), &b),
        Err(StorageError::Conflict { .. })
    ));
    let before = LedgerSnapshot::capture(&s).unwrap();
    assert!(matches!(
        s.reserve_and_bind(&small, &subject(2), &b),
        Err(StorageError::Overflow { max_sequence: 1, .. })
    ));
    assert_eq!(LedgerSnapshot::capture(&s).unwrap(), before);
}

#[test]
fn at_sqlite_db_03_historical_rows_and_unique_constraints() {
    let s = SqliteCounterLedger::in_memory().unwrap();
    let c = codec();
    let b = bucket(Gender::Female, "54");
    let historical = CounterRecord::v1(&c, subject(9), b.clone(), 40, UnixTimeMs(5)).unwrap();
    s.insert_historical_row(&historical).unwrap();
    assert_eq!(s.max_sequence_in_bucket(&b).unwrap(), Some(40));

    let mut same_counter = CounterRecord::v1(&c, subject(10), b.clone(), 41, UnixTimeMs(5)).unwrap();
    same_counter.counter = historical.counter.clone();
    assert!(matches!(
        s.insert_historical_row(&same_counter),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert!(matches!(
        s.insert_historical_row(&historical),
        Err(StorageError::Conflict { .. })
    ));

    let r = s.reserve_and_bind(&c, &subject(11), &b).unwrap();
    assert_eq!(r.sequence, 41);
}

fn reserve_from_own_connection(path: &Path, subjects: std::ops::Range<u64>) -> Vec<String> {
    let s = SqliteCounterLedger::open(path).unwrap();
    let c = codec();
    let b = bucket(Gender::Female, "54");
    subjects
        .map(|n| s.reserve_and_bind(&c, &subject(n), &b).unwrap().counter)
        .collect()
}

#[test]
fn at_sqlite_db_04_independent_connections_serialize_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let path = ledger_path(&dir);
    SqliteCounterLedger::open(&path).unwrap();

    let counters: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u64)
            .map(|worker| {
                let path = path.as_path();
                scope.spawn(move || {
                    reserve_from_own_connection(path, worker * 100..worker * 100 + 5)
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let distinct: BTreeSet<_> = counters.iter().cloned().collect();
    assert_eq!(distinct.len(), 20);
    let s = SqliteCounterLedger::open(&path).unwrap();
    assert_eq!(
        s.max_sequence_in_bucket(&bucket(Gender::Female, "54"))
            .unwrap(),
        Some(20)
    );
}

#[test]
fn at_sqlite_db_05_same_subject_race_binds_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = ledger_path(&dir);
    SqliteCounterLedger::open(&path).unwrap();

    let results: Vec<Result<CounterRecord, StorageError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let path = path.as_path();
                scope.spawn(move || {
                    let s = SqliteCounterLedger::open(path).unwrap();
                    s.reserve_and_bind(&codec(), &subject(42), &bucket(Gender::Male, "54"))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let won = results.iter().filter(|r| r.is_ok()).count();
    let lost = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::Conflict { .. })))
        .count();
    assert_eq!(won, 1);
    assert_eq!(lost, 5);
    let s = SqliteCounterLedger::open(&path).unwrap();
    assert_eq!(s.ledger_records().unwrap().len(), 1);
}

#[test]
fn at_sqlite_db_06_set_sequence_position_upserts() {
    let s = SqliteCounterLedger::in_memory().unwrap();
    let b = bucket(Gender::Female, "12");
    s.set_sequence_position(&b, 7).unwrap();
    s.set_sequence_position(&b, 9).unwrap();
    assert_eq!(s.sequence_positions().unwrap().get(&b), Some(&9));
    assert!(s.set_sequence_position(&b, 0).is_err());
}

#[test]
fn at_sqlite_db_07_rebinding_a_subject_is_conflict_whichever_constraint_fires() {
    let s = SqliteCounterLedger::in_memory().unwrap();
    let c = codec();
    let female = bucket(Gender::Female, "54");
    let male = bucket(Gender::Male, "53");
    let first = CounterRecord::v1(&c, subject(3), female.clone(), 7, UnixTimeMs(1)).unwrap();
    s.insert_historical_row(&first).unwrap();
    let before = LedgerSnapshot::capture(&s).unwrap();

    // Same subject, same bucket and sequence: every UNIQUE index collides.
    assert!(matches!(
        s.insert_historical_row(&first),
        Err(StorageError::Conflict { .. })
    ));
    // Same subject in an unrelated bucket: only the subject collides.
    let elsewhere = CounterRecord::v1(&c, subject(3), male, 2, UnixTimeMs(1)).unwrap();
    assert!(matches!(
        s.insert_historical_row(&elsewhere),
        Err(StorageError::Conflict { .. })
    ));
    assert!(matches!(
        s.reserve_and_bind(&c, &subject(3), &female),
        Err(StorageError::Conflict { .. })
    ));
    assert_eq!(LedgerSnapshot::capture(&s).unwrap(), before);
}
