#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use counter_contracts::counter::{
    Bucket, CounterCodec, CounterFormat, CounterRecord, Gender, PrefixMap, SubjectHash, YearCode,
};
use counter_contracts::UnixTimeMs;
use counter_storage::{CounterRepository, InMemoryCounterLedger, LedgerSnapshot, StorageError};

fn subject(n: u64) -> SubjectHash {
    SubjectHash::new(format!("{n:064x}")).unwrap()
}

fn bucket(gender: Gender, year: &str) -> Bucket {
    Bucket::new(gender, YearCode::new(year).unwrap())
}

fn codec() -> CounterCodec {
    CounterCodec::mvp_v1().unwrap()
}

#[test]
fn at_ledger_db_01_sequences_are_per_bucket() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = codec();
    let female = bucket(Gender::Female, "54");
    let male = bucket(Gender::Male, "54");

    let a = s.reserve_and_bind(&c, &subject(1), &female).unwrap();
    let b = s.reserve_and_bind(&c, &subject(2), &female).unwrap();
    let m = s.reserve_and_bind(&c, &subject(3), &male).unwrap();

    assert_eq!(a.counter, "373540001");
    assert_eq!(b.counter, "373540002");
    assert_eq!(m.counter, "357540001");
    assert_eq!(s.max_sequence_in_bucket(&female).unwrap(), Some(2));
    assert_eq!(s.sequence_positions().unwrap().get(&female), Some(&3));
}

#[test]
fn at_ledger_db_02_second_bind_for_subject_is_conflict() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = codec();
    let b = bucket(Gender::Female, "54");
    s.reserve_and_bind(&c, &subject(7), &b).unwrap();

    assert!(matches!(
        s.reserve_and_bind(&c, &subject(7), &b),
        Err(StorageError::Conflict { .. })
    ));
    assert_eq!(s.ledger_records().unwrap().len(), 1);
    assert_eq!(s.sequence_positions().unwrap().get(&b), Some(&2));
}

#[test]
fn at_ledger_db_03_overflow_fails_before_insert() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = CounterCodec::new(PrefixMap::mvp_v1(), CounterFormat::new(4, 3).unwrap()).unwrap();
    let b = bucket(Gender::Male, "54");
    for n in 1..=3 {
        let r = s.reserve_and_bind(&c, &subject(n), &b).unwrap();
        assert_eq!(r.sequence, n as u32);
    }
    let before = LedgerSnapshot::capture(&s).unwrap();

    assert!(matches!(
        s.reserve_and_bind(&c, &subject(4), &b),
        Err(StorageError::Overflow { max_sequence: 3, .. })
    ));
    assert_eq!(LedgerSnapshot::capture(&s).unwrap(), before);
    assert!(s.find_by_subject(&subject(4)).unwrap().is_none());
}

#[test]
fn at_ledger_db_04_historical_rows_push_reservation_forward() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = codec();
    let b = bucket(Gender::Female, "54");
    let historical =
        CounterRecord::v1(&c, subject(100), b.clone(), 50, UnixTimeMs(1)).unwrap();
    s.insert_historical_row(historical).unwrap();
    assert!(s.sequence_positions().unwrap().is_empty());

    let r = s.reserve_and_bind(&c, &subject(101), &b).unwrap();
    assert_eq!(r.sequence, 51);
    assert_eq!(r.counter, "373540051");
}

#[test]
fn at_ledger_db_05_append_only_enforced() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = codec();
    s.reserve_and_bind(&c, &subject(1), &bucket(Gender::Female, "54"))
        .unwrap();
    assert!(matches!(
        s.attempt_overwrite_counter_row(&subject(1)),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_ledger_db_06_historical_duplicate_counter_rejected() {
    let s = InMemoryCounterLedger::new_in_memory();
    let c = codec();
    let b = bucket(Gender::Female, "54");
    let first = CounterRecord::v1(&c, subject(1), b.clone(), 9, UnixTimeMs(1)).unwrap();
    let mut clash = CounterRecord::v1(&c, subject(2), b, 10, UnixTimeMs(1)).unwrap();
    clash.counter = first.counter.clone();
    s.insert_historical_row(first).unwrap();
    assert!(matches!(
        s.insert_historical_row(clash),
        Err(StorageError::DuplicateKey { .. })
    ));
}

#[test]
fn at_ledger_db_07_concurrent_reservations_never_share_a_sequence() {
    let s = Arc::new(InMemoryCounterLedger::new_in_memory());
    let c = codec();
    let b = bucket(Gender::Male, "03");

    let counters: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16u64)
            .map(|n| {
                let s = Arc::clone(&s);
                let c = &c;
                let b = &b;
                scope.spawn(move || s.reserve_and_bind(c, &subject(n), b).unwrap().counter)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let distinct: BTreeSet<_> = counters.iter().cloned().collect();
    assert_eq!(distinct.len(), 16);
    assert_eq!(s.max_sequence_in_bucket(&b).unwrap(), Some(16));
}

#[test]
fn at_ledger_db_08_sequence_position_can_be_realigned() {
    let s = InMemoryCounterLedger::new_in_memory();
    let b = bucket(Gender::Female, "54");
    s.set_sequence_position(&b, 12).unwrap();
    assert_eq!(s.sequence_positions().unwrap().get(&b), Some(&12));
    assert!(s.set_sequence_position(&b, 0).is_err());

    let r = s.reserve_and_bind(&codec(), &subject(1), &b).unwrap();
    assert_eq!(r.sequence, 12);
}
