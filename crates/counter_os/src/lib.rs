#![forbid(unsafe_code)]

pub mod api;
pub mod audit;
pub mod backfill;
pub mod config;
pub mod error;
pub mod service;

pub use api::{assign_counter, AssignCounterResponse};
pub use audit::{AuditFinding, AuditReport, LedgerAuditor};
pub use backfill::{Action, BackfillRecord, BackfillReconciler, BackfillReport, Finding};
pub use config::{ConfigError, CounterConfig, DeployEnv};
pub use error::{error_codes, CounterError};
pub use service::{AllocationOutcome, CounterService};
