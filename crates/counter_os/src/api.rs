#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::service::CounterService;

/// `{ok, payload}` envelope returned to callers that cannot consume typed
/// errors. On success `payload` is `{"counter": ...}`; on failure it is the
/// error's `{code, message_fa, details?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignCounterResponse {
    pub ok: bool,
    pub payload: Value,
}

impl AssignCounterResponse {
    pub fn counter(&self) -> Option<&str> {
        if !self.ok {
            return None;
        }
        self.payload.get("counter").and_then(Value::as_str)
    }

    pub fn error_code(&self) -> Option<&str> {
        if self.ok {
            return None;
        }
        self.payload.get("code").and_then(Value::as_str)
    }
}

pub fn assign_counter(
    service: &CounterService,
    national_id: &str,
    gender: i64,
    year: Option<&str>,
) -> AssignCounterResponse {
    let year = year.map(str::trim).filter(|y| !y.is_empty());
    match service.get_or_create(national_id, gender, year) {
        Ok(counter) => AssignCounterResponse {
            ok: true,
            payload: json!({ "counter": counter }),
        },
        Err(e) => {
            tracing::warn!(event = "counter_assign_failed", code = e.code(), error = %e);
            AssignCounterResponse {
                ok: false,
                payload: e.to_payload(),
            }
        }
    }
}
