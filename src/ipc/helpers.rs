use crate::ipc::error::err;
use crate::ledger::{self, LedgerError};
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

/// Boundary mapping: the gateway is the only place core errors become
/// user-facing outcomes.
impl From<LedgerError> for HandlerErr {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Validation(message) => HandlerErr {
                code: "validation_failed",
                message,
                details: None,
            },
            LedgerError::EmptySubmission => HandlerErr {
                code: "empty_submission",
                message: "no qualifying rows in submission".to_string(),
                details: Some(json!({ "warning": true })),
            },
            LedgerError::Aggregation(message) => HandlerErr {
                code: "aggregation_failed",
                message,
                details: None,
            },
            LedgerError::Store(e) => HandlerErr {
                code: "store_unavailable",
                message: e.to_string(),
                details: None,
            },
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

const STORE_RETRY_ATTEMPTS: u32 = 3;

/// Run a submission closure, retrying busy/locked store failures with a
/// short linear backoff. Non-transient errors and exhausted retries pass
/// straight through with nothing committed.
pub fn with_store_retry<T>(
    mut apply: impl FnMut() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let mut attempt: u32 = 0;
    loop {
        match apply() {
            Err(e) if ledger::is_transient(&e) && attempt + 1 < STORE_RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::warn!(attempt, "store busy, retrying submission");
                std::thread::sleep(std::time::Duration::from_millis(50 * attempt as u64));
            }
            other => return other,
        }
    }
}
