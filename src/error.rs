//! Error types for the query client.

use std::fmt;
use std::sync::Arc;

/// Errors surfaced synchronously by the query client.
///
/// Backend failures are not here: they arrive as
/// [`RawResult::Error`](crate::RawResult::Error) through the normal delivery
/// path and are handled by each query's transform.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// No definition is registered under this name. Never retried.
    #[error("unknown query: {name}")]
    UnknownQuery {
        /// The requested name.
        name: String,
    },

    /// The name is registered, but to a different definition type than the
    /// caller asked for.
    #[error("query {name} is not registered as {expected}")]
    DefinitionMismatch {
        /// The requested name.
        name: String,
        /// Type name the caller expected.
        expected: &'static str,
    },

    /// Arguments given to a name-keyed call did not decode into the
    /// definition's argument type.
    #[error("invalid arguments for query {name}: {source}")]
    InvalidArguments {
        /// The requested name.
        name: String,
        /// Decoding failure.
        source: Arc<serde_json::Error>,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(Arc<serde_json::Error>),

    /// The transport refused a message.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure to hand a message to the underlying channel.
///
/// Wraps any error convertible into [`anyhow::Error`].
#[derive(Clone)]
pub struct TransportError(Arc<anyhow::Error>);

impl TransportError {
    /// Wrap an error.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Create an error from a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Access the inner error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportError({:?})", self.0)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}
