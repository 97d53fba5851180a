//! Key type for request caching.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The fully rendered text of a query, used both as the cache key and as the
/// literal payload sent to the backend.
///
/// Two logical queries that render to the same string are the same cached
/// query. This is cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryString(Arc<str>);

impl QueryString {
    /// Create a query string from rendered text.
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// Get the rendered text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for QueryString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for QueryString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for QueryString {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for QueryString {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for QueryString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(QueryString::from("ECHO:a"), 1);
        assert_eq!(map.get("ECHO:a"), Some(&1));
        assert_eq!(map.get("ECHO:b"), None);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let key = QueryString::from("SELECT 1");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"SELECT 1\"");
        assert_eq!(format!("{:?}", key), "\"SELECT 1\"");
        assert_eq!(key.to_string(), "SELECT 1");
    }

    #[test]
    fn test_deserializes_from_plain_string() {
        let key: QueryString = serde_json::from_str("\"SELECT 2\"").unwrap();
        assert_eq!(key, QueryString::from("SELECT 2"));
        assert!(serde_json::from_str::<QueryString>("2").is_err());
    }
}
