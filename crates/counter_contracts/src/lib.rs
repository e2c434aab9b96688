#![forbid(unsafe_code)]

pub mod common;
pub mod counter;

pub use common::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};
