//! Name-keyed registry of query definitions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::{Erased, ErasedDefinition, QueryDefinition};
use crate::error::ClientError;

/// Static mapping from a query's logical name to its definition.
///
/// Populated once at startup and read-only afterwards; the client holds it
/// behind an `Arc`.
#[derive(Default)]
pub struct QueryRegistry {
    definitions: HashMap<&'static str, Arc<dyn ErasedDefinition>, ahash::RandomState>,
}

impl QueryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under [`QueryDefinition::NAME`], replacing any
    /// previous definition with that name.
    pub fn register<D: QueryDefinition>(&mut self, definition: D) -> &mut Self {
        let erased: Arc<dyn ErasedDefinition> = Arc::new(Erased(Arc::new(definition)));
        if self.definitions.insert(D::NAME, erased).is_some() {
            tracing::debug!(query = D::NAME, "replaced query definition");
        }
        self
    }

    /// Look up a definition by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ErasedDefinition>, ClientError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownQuery {
                name: name.to_string(),
            })
    }

    /// Look up the definition registered under `D::NAME` as its concrete type.
    pub fn resolve_typed<D: QueryDefinition>(&self) -> Result<Arc<D>, ClientError> {
        self.resolve(D::NAME)?
            .into_any()
            .downcast::<D>()
            .map_err(|_| ClientError::DefinitionMismatch {
                name: D::NAME.to_string(),
                expected: std::any::type_name::<D>(),
            })
    }

    /// Returns `true` if a definition is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.definitions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawResult;
    use serde_json::json;

    struct Echo;

    impl QueryDefinition for Echo {
        const NAME: &'static str = "echo";
        type Args = String;
        type Output = Option<i64>;

        fn query_string(&self, args: &String) -> String {
            format!("ECHO:{args}")
        }

        fn transform(&self, raw: &RawResult, _args: &String) -> Option<i64> {
            raw.rows()?.first()?.get("v")?.as_i64()
        }
    }

    struct Impostor;

    impl QueryDefinition for Impostor {
        const NAME: &'static str = "echo";
        type Args = ();
        type Output = ();

        fn query_string(&self, _args: &()) -> String {
            "IMPOSTOR".to_string()
        }

        fn transform(&self, _raw: &RawResult, _args: &()) {}
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = QueryRegistry::new();
        let err = registry.resolve("missing").err().unwrap();
        assert!(matches!(err, ClientError::UnknownQuery { ref name } if name == "missing"));
        assert!(matches!(
            registry.resolve_typed::<Echo>(),
            Err(ClientError::UnknownQuery { .. })
        ));
    }

    #[test]
    fn test_resolve_typed_and_erased() {
        let mut registry = QueryRegistry::new();
        registry.register(Echo);

        let echo = registry.resolve_typed::<Echo>().unwrap();
        assert_eq!(echo.query_string(&"a".to_string()), "ECHO:a");

        let erased = registry.resolve("echo").unwrap();
        assert_eq!(erased.name(), "echo");
        assert_eq!(erased.query_string_json(&json!("a")).unwrap().as_str(), "ECHO:a");
        let raw = RawResult::Rows(vec![json!({"v": 42})]);
        assert_eq!(erased.transform_json(&raw, &json!("a")), json!(42));
    }

    #[test]
    fn test_invalid_json_arguments() {
        let mut registry = QueryRegistry::new();
        registry.register(Echo);
        let erased = registry.resolve("echo").unwrap();
        assert!(matches!(
            erased.query_string_json(&json!({"not": "a string"})),
            Err(ClientError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_definition_mismatch() {
        let mut registry = QueryRegistry::new();
        registry.register(Impostor);
        assert!(matches!(
            registry.resolve_typed::<Echo>(),
            Err(ClientError::DefinitionMismatch { .. })
        ));
        assert_eq!(registry.names(), vec!["echo"]);
    }
}
