#![forbid(unsafe_code)]

pub mod ledger;
pub mod repo;
pub mod sqlite;

pub use ledger::{InMemoryCounterLedger, StorageError};
pub use repo::{CounterRepository, LedgerSnapshot};
pub use sqlite::SqliteCounterLedger;
