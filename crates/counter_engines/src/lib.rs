#![forbid(unsafe_code)]

pub mod hashing;
pub mod metrics;
pub mod year;
