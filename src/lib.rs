//! Query-Cache: request deduplication and result caching for dashboard
//! queries sent over a single persistent connection.
//!
//! A view asks for a logical query by name and arguments; the client renders
//! the query string, and then either replays a cached result, joins a
//! request already in flight, or sends a new one. Every caller gets its own
//! cancellable [`QueryHandle`].
//!
//! # Key Features
//!
//! - **At most one in-flight request per query string**: concurrent callers
//!   share a single fetch and are notified in the order they asked
//! - **Session-long result cache**: completed results, including backend
//!   errors by default, are replayed without touching the transport
//! - **Memoized transforms**: raw rows are turned into typed view models once
//!   per delivered result
//! - **Cooperative cancellation**: cancelling one handle never disturbs other
//!   waiters or the shared cache
//!
//! # Example
//!
//! ```ignore
//! use query_cache::dashboard::{dashboard_registry, TripCountsByDayHour};
//! use query_cache::{ChannelTransport, ClientConfig, QueryClient, QuerySlot};
//!
//! let config = ClientConfig::default();
//! let (transport, outbound) = ChannelTransport::new();
//! let client = QueryClient::builder()
//!     .config(config.clone())
//!     .build(dashboard_registry(&config), transport);
//!
//! let mut slot = QuerySlot::new();
//! let counts = client.query_in_slot::<TripCountsByDayHour>(&mut slot, 72)?.await;
//! ```
//!
//! # Unbounded Growth
//!
//! Neither cache evicts on its own: each distinct query string stays for the
//! session. Long-lived embedders can call [`RequestCache::evict`] and
//! [`TransformCache::invalidate`].

mod cache;
mod client;
mod config;
pub mod dashboard;
mod definition;
mod error;
mod key;
mod raw;
mod registry;
mod transform;
mod transport;
pub mod tracer;

pub use cache::{Acquired, EntrySnapshot, FetchState, RequestCache, Waiter, WaiterId, Withdrawn};
pub use client::{Canceller, QueryClient, QueryClientBuilder, QueryHandle, QuerySlot};
pub use config::{CancelHintPolicy, ClientConfig, ErrorPolicy, DEFAULT_TABLE_NAME};
pub use definition::{ErasedDefinition, QueryDefinition};
pub use error::{ClientError, TransportError};
pub use key::QueryString;
pub use raw::{ErrorPayload, RawResult, Row};
pub use registry::QueryRegistry;
pub use tracer::{AcquireKind, CancelKind, NoopTracer, Tracer};
pub use transform::{MemoStatus, TransformCache};
pub use transport::{ChannelTransport, ClientMessage, ServerMessage, Transport, TransportAdapter};
