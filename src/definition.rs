//! Query definition trait.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;
use crate::key::QueryString;
use crate::raw::RawResult;

/// A logical query: how to render its arguments into a query string, and how
/// to turn the raw rows the backend returns into a typed view model.
///
/// Both methods must be pure. `query_string` must be deterministic and must
/// give semantically different arguments different strings, since the string
/// is the cache key.
///
/// # Error Handling
///
/// `transform` sees backend failures as [`RawResult::Error`]. Queries that
/// want to surface failures use a `Result` output type; queries that can show
/// an empty view pick a fallback value instead.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl QueryDefinition for Echo {
///     const NAME: &'static str = "echo";
///     type Args = String;
///     type Output = serde_json::Value;
///
///     fn query_string(&self, args: &String) -> String {
///         format!("ECHO:{args}")
///     }
///
///     fn transform(&self, raw: &RawResult, _args: &String) -> serde_json::Value {
///         raw.rows().and_then(|rows| rows.first()).cloned().into()
///     }
/// }
/// ```
pub trait QueryDefinition: Send + Sync + 'static {
    /// Name the query is registered and requested under.
    const NAME: &'static str;

    /// Arguments the query is parameterized by.
    type Args: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Typed result handed to callers.
    type Output: Serialize + Send + Sync + 'static;

    /// Render the query string for these arguments.
    fn query_string(&self, args: &Self::Args) -> String;

    /// Transform a raw result into the typed output.
    fn transform(&self, raw: &RawResult, args: &Self::Args) -> Self::Output;
}

/// Object-safe view of a [`QueryDefinition`], used by the registry to key
/// definitions of different types by name.
pub trait ErasedDefinition: Send + Sync {
    /// Registered name.
    fn name(&self) -> &'static str;

    /// Type name of the concrete definition.
    fn type_name(&self) -> &'static str;

    /// Get the definition as `Arc<dyn Any>` for downcasting shared ownership.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Decode JSON arguments and render the query string.
    fn query_string_json(&self, args: &Value) -> Result<QueryString, ClientError>;

    /// Decode JSON arguments, transform, and encode the output as JSON.
    fn transform_json(&self, raw: &RawResult, args: &Value) -> Value;
}

/// Adapter that erases a typed definition.
pub(crate) struct Erased<D>(pub(crate) Arc<D>);

impl<D: QueryDefinition> Erased<D> {
    fn decode_args(&self, args: &Value) -> Result<D::Args, ClientError> {
        D::Args::deserialize(args).map_err(|err| ClientError::InvalidArguments {
            name: D::NAME.to_string(),
            source: Arc::new(err),
        })
    }
}

impl<D: QueryDefinition> ErasedDefinition for Erased<D> {
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<D>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self.0.clone()
    }

    fn query_string_json(&self, args: &Value) -> Result<QueryString, ClientError> {
        let args = self.decode_args(args)?;
        Ok(QueryString::from(self.0.query_string(&args)))
    }

    fn transform_json(&self, raw: &RawResult, args: &Value) -> Value {
        // Arguments were validated when the query string was rendered.
        let Ok(args) = self.decode_args(args) else {
            return Value::Null;
        };
        let output = self.0.transform(raw, &args);
        serde_json::to_value(&output).unwrap_or_else(|err| {
            tracing::warn!(query = D::NAME, %err, "failed to encode transformed output");
            Value::Null
        })
    }
}
