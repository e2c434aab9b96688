#![forbid(unsafe_code)]

pub mod counter_cli;
