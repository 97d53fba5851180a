//! Client configuration.

use serde::{Deserialize, Serialize};

/// Default name of the trips table the dashboard queries run against.
pub const DEFAULT_TABLE_NAME: &str = "citibike_trips";

/// What to do when an `acquire` finds a cached backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Replay the cached error like any other result for the rest of the
    /// session.
    #[default]
    Retain,
    /// Treat a cached error as absent: the next `acquire` starts a new fetch.
    RetryOnAcquire,
}

/// When cancelling a handle sends the upstream cancel hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelHintPolicy {
    /// Whenever the cancelled handle was still waiting.
    #[default]
    Always,
    /// Only when the cancelled handle was the last waiter on an in-flight
    /// fetch, so other waiters never depend on a fetch the backend was told
    /// to drop.
    LastWaiter,
}

/// Configuration for a [`QueryClient`](crate::QueryClient).
///
/// Deserializable so embedders can load it from their own settings file;
/// every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Table the dashboard queries read from.
    pub table_name: String,
    /// Handling of cached backend errors.
    pub error_policy: ErrorPolicy,
    /// Handling of upstream cancel hints.
    pub cancel_hint: CancelHintPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            error_policy: ErrorPolicy::default(),
            cancel_hint: CancelHintPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"error_policy": "retry_on_acquire"}"#).unwrap();
        assert_eq!(config.error_policy, ErrorPolicy::RetryOnAcquire);
        assert_eq!(config.cancel_hint, CancelHintPolicy::Always);
        assert_eq!(config.table_name, "citibike_trips");
    }
}
