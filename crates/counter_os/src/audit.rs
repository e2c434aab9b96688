#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use counter_contracts::counter::{Bucket, CounterCodec};
use counter_storage::{CounterRepository, StorageError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditFinding {
    InvalidFormat {
        national_id_hash: String,
        counter: String,
    },
    DuplicateCounter {
        counter: String,
        occurrences: usize,
    },
    SequenceOutOfBounds {
        bucket: String,
        next_seq: u32,
        max_sequence: u32,
    },
    SequenceMisaligned {
        bucket: String,
        next_seq: Option<u32>,
        expected: u32,
    },
}

impl AuditFinding {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditFinding::InvalidFormat { .. } => "invalid_format",
            AuditFinding::DuplicateCounter { .. } => "duplicate_counter",
            AuditFinding::SequenceOutOfBounds { .. } => "sequence_out_of_bounds",
            AuditFinding::SequenceMisaligned { .. } => "sequence_misaligned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub records_checked: usize,
    pub buckets_checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut out = BTreeMap::new();
        for f in &self.findings {
            *out.entry(f.kind()).or_insert(0) += 1;
        }
        out
    }
}

/// Post-migration consistency checks over a ledger. Read-only.
pub struct LedgerAuditor<'a> {
    repo: &'a dyn CounterRepository,
    codec: &'a CounterCodec,
}

impl<'a> LedgerAuditor<'a> {
    pub fn new(repo: &'a dyn CounterRepository, codec: &'a CounterCodec) -> Self {
        Self { repo, codec }
    }

    pub fn run(&self) -> Result<AuditReport, StorageError> {
        let records = self.repo.ledger_records()?;
        let positions = self.repo.sequence_positions()?;
        let mut findings = Vec::new();

        let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
        let mut ledger_max: BTreeMap<Bucket, u32> = BTreeMap::new();
        for record in &records {
            if !record.is_canonical(self.codec) {
                findings.push(AuditFinding::InvalidFormat {
                    national_id_hash: record.national_id_hash.as_str().to_string(),
                    counter: record.counter.clone(),
                });
            }
            *occurrences.entry(record.counter.as_str()).or_insert(0) += 1;
            let max = ledger_max.entry(record.bucket()).or_insert(0);
            *max = (*max).max(record.sequence);
        }
        findings.extend(
            occurrences
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(counter, n)| AuditFinding::DuplicateCounter {
                    counter: counter.to_string(),
                    occurrences: n,
                }),
        );

        // A full bucket legitimately parks next_seq one past the maximum.
        let ceiling = self.codec.format().max_sequence.saturating_add(1);
        for (bucket, next_seq) in &positions {
            if *next_seq == 0 || *next_seq > ceiling {
                findings.push(AuditFinding::SequenceOutOfBounds {
                    bucket: bucket.to_string(),
                    next_seq: *next_seq,
                    max_sequence: self.codec.format().max_sequence,
                });
            }
        }
        for (bucket, max) in &ledger_max {
            let expected = max.saturating_add(1);
            let next_seq = positions.get(bucket).copied();
            if next_seq != Some(expected) {
                findings.push(AuditFinding::SequenceMisaligned {
                    bucket: bucket.to_string(),
                    next_seq,
                    expected,
                });
            }
        }

        let mut buckets: Vec<&Bucket> = positions.keys().chain(ledger_max.keys()).collect();
        buckets.sort();
        buckets.dedup();

        let report = AuditReport {
            records_checked: records.len(),
            buckets_checked: buckets.len(),
            findings,
        };
        tracing::info!(
            event = "counter_ledger_audit",
            records = report.records_checked,
            buckets = report.buckets_checked,
            findings = report.findings.len(),
        );
        Ok(report)
    }
}
