//! Raw tabular results as they come back from the database service.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single result row. The database service sends objects keyed by column
/// name (e.g. `"count_star()"`); the cache itself does not look inside.
pub type Row = Value;

/// Error reported by the backend for a query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message from the database.
    pub message: String,
}

impl ErrorPayload {
    /// Create an error payload from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the backend returned for a query string.
///
/// Errors are an ordinary variant: the caches store and replay them exactly
/// like rows, and each query's transform decides how to present them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawResult {
    /// Ordered result rows. Row shape depends on the query.
    Rows(Vec<Row>),
    /// The database failed to execute the query.
    Error(ErrorPayload),
}

impl RawResult {
    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        RawResult::Error(ErrorPayload::new(message))
    }

    /// Get the rows if this is a successful result.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            RawResult::Rows(rows) => Some(rows),
            RawResult::Error(_) => None,
        }
    }

    /// Get the error payload if the backend failed.
    pub fn error_payload(&self) -> Option<&ErrorPayload> {
        match self {
            RawResult::Rows(_) => None,
            RawResult::Error(err) => Some(err),
        }
    }

    /// Returns `true` if this is an error result.
    pub fn is_error(&self) -> bool {
        matches!(self, RawResult::Error(_))
    }
}

impl From<Vec<Row>> for RawResult {
    fn from(rows: Vec<Row>) -> Self {
        RawResult::Rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_rows_or_error() {
        let rows: RawResult = serde_json::from_value(json!([{"count_star()": 3}])).unwrap();
        assert_eq!(rows.rows().map(|r| r.len()), Some(1));
        assert!(!rows.is_error());

        let err: RawResult = serde_json::from_value(json!({"message": "no such table"})).unwrap();
        assert_eq!(err.error_payload().unwrap().message, "no such table");
        assert!(err.rows().is_none());
    }
}
