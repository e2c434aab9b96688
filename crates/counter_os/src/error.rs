#![forbid(unsafe_code)]

use counter_contracts::counter::{Bucket, YearCode};
use counter_contracts::ContractViolation;
use counter_storage::StorageError;
use serde_json::{json, Map, Value};
use thiserror::Error;

pub mod error_codes {
    pub const E_INVALID_NID: &str = "E_INVALID_NID";
    pub const E_INVALID_GENDER: &str = "E_INVALID_GENDER";
    pub const E_YEAR_CODE_INVALID: &str = "E_YEAR_CODE_INVALID";
    pub const E_YEAR_MISMATCH: &str = "E_YEAR_MISMATCH";
    pub const E_DB_CONFLICT: &str = "E_DB_CONFLICT";
    pub const E_COUNTER_EXHAUSTED: &str = "E_COUNTER_EXHAUSTED";
    pub const E_DB_FAILURE: &str = "E_DB_FAILURE";
}

/// Failures surfaced by allocation. Every variant maps onto a stable code and
/// a Persian message for the end user.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("invalid national id: {0}")]
    InvalidNationalId(ContractViolation),

    #[error("invalid gender: {0}")]
    InvalidGender(ContractViolation),

    #[error("invalid year code: {0}")]
    InvalidYearCode(ContractViolation),

    #[error("year code {requested} does not match the current academic year {resolved}")]
    YearMismatch {
        requested: YearCode,
        resolved: YearCode,
    },

    #[error("bind conflict unresolved after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("sequence space exhausted for bucket {bucket} (max {max_sequence})")]
    Exhausted { bucket: Bucket, max_sequence: u32 },

    #[error("storage failure: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for CounterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Overflow {
                bucket,
                max_sequence,
            } => CounterError::Exhausted {
                bucket,
                max_sequence,
            },
            StorageError::Conflict { .. } => CounterError::Conflict { attempts: 1 },
            other => CounterError::Storage(other),
        }
    }
}

impl CounterError {
    pub fn code(&self) -> &'static str {
        match self {
            CounterError::InvalidNationalId(_) => error_codes::E_INVALID_NID,
            CounterError::InvalidGender(_) => error_codes::E_INVALID_GENDER,
            CounterError::InvalidYearCode(_) => error_codes::E_YEAR_CODE_INVALID,
            CounterError::YearMismatch { .. } => error_codes::E_YEAR_MISMATCH,
            CounterError::Conflict { .. } => error_codes::E_DB_CONFLICT,
            CounterError::Exhausted { .. } => error_codes::E_COUNTER_EXHAUSTED,
            CounterError::Storage(_) => error_codes::E_DB_FAILURE,
        }
    }

    pub fn message_fa(&self) -> &'static str {
        match self {
            CounterError::InvalidNationalId(_) => "شناسه ملی باید شامل ۱۰ رقم باشد.",
            CounterError::InvalidGender(_) => "جنسیت نامعتبر است (صرفاً ۰ یا ۱ مجاز است).",
            CounterError::InvalidYearCode(_) => "کد سال تحصیلی باید شامل دو رقم باشد.",
            CounterError::YearMismatch { .. } => "کد سال تحصیلی با منبع معتبر همخوانی ندارد.",
            CounterError::Conflict { .. } => "رزرو توالی ناموفق بود.",
            CounterError::Exhausted { .. } => "ظرفیت توالی سال/پیشوند تکمیل شده است.",
            CounterError::Storage(_) => "خطای داخلی بانک اطلاعاتی در رزرو توالی.",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CounterError::InvalidNationalId(_)
                | CounterError::InvalidGender(_)
                | CounterError::InvalidYearCode(_)
        )
    }

    /// Structured context safe to return to callers. Never carries raw ids.
    pub fn details(&self) -> Option<Value> {
        match self {
            CounterError::InvalidNationalId(v)
            | CounterError::InvalidGender(v)
            | CounterError::InvalidYearCode(v) => Some(json!({
                "field": v.field(),
                "reason": v.to_string(),
            })),
            CounterError::YearMismatch {
                requested,
                resolved,
            } => Some(json!({
                "requested": requested.as_str(),
                "resolved": resolved.as_str(),
            })),
            CounterError::Conflict { attempts } => Some(json!({ "attempts": attempts })),
            CounterError::Exhausted {
                bucket,
                max_sequence,
            } => Some(json!({
                "year_code": bucket.year_code.as_str(),
                "gender": bucket.gender.code(),
                "max_sequence": max_sequence,
            })),
            CounterError::Storage(e) => Some(json!({ "error": e.to_string() })),
        }
    }

    /// `{code, message_fa, details?}`.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::from(self.code()));
        payload.insert("message_fa".to_string(), Value::from(self.message_fa()));
        if let Some(details) = self.details() {
            payload.insert("details".to_string(), details);
        }
        Value::Object(payload)
    }
}
