//! Tracer trait for observing cache and transport activity.
//!
//! The default [`NoopTracer`] discards everything. Logging through the
//! `tracing` crate happens independently of the installed tracer; implement
//! [`Tracer`] when you need structured callbacks, e.g. to count sends in a
//! test or feed a debug panel.
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryString, Tracer};
//!
//! struct SendLogger;
//!
//! impl Tracer for SendLogger {
//!     fn on_send(&self, query: &QueryString) {
//!         println!("sent: {query}");
//!     }
//! }
//!
//! let client = QueryClient::builder().tracer(SendLogger).build(registry, transport);
//! ```

use crate::key::QueryString;

/// How an `acquire` on the request cache was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireKind {
    /// A cached result was replayed; nothing was sent.
    Replayed,
    /// The waiter joined a fetch already in flight.
    Joined,
    /// The waiter started a new fetch; the caller must send.
    Started,
}

/// Why a waiter stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelKind {
    /// Caller cancelled and the upstream cancel hint was sent.
    WithHint,
    /// Caller cancelled without notifying upstream.
    Local,
}

/// Tracer trait for observing the query client.
///
/// All methods have empty default implementations, so override only the
/// events you care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; deliveries may run on whichever
/// task drives the transport.
pub trait Tracer: Send + Sync + 'static {
    /// Called after the request cache classified an `acquire`.
    #[inline]
    fn on_acquire(&self, _query: &QueryString, _kind: AcquireKind) {}

    /// Called when an execute message is handed to the transport.
    #[inline]
    fn on_send(&self, _query: &QueryString) {}

    /// Called after a result was stored and its waiters notified.
    #[inline]
    fn on_deliver(&self, _query: &QueryString, _waiters_notified: usize) {}

    /// Called when a waiter is withdrawn by its handle.
    #[inline]
    fn on_waiter_cancelled(&self, _query: &QueryString, _kind: CancelKind) {}

    /// Called when a typed result is obtained for a query string.
    ///
    /// `memo_hit` is `true` when the memoized transform was reused.
    #[inline]
    fn on_transform(&self, _query: &QueryString, _memo_hit: bool) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`QueryClient`](crate::QueryClient).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        send_count: AtomicUsize,
        deliver_count: AtomicUsize,
    }

    impl CountingTracer {
        fn new() -> Self {
            Self {
                send_count: AtomicUsize::new(0),
                deliver_count: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for CountingTracer {
        fn on_send(&self, _query: &QueryString) {
            self.send_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_deliver(&self, _query: &QueryString, _waiters_notified: usize) {
            self.deliver_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::new();
        let key = QueryString::from("SELECT 1");

        tracer.on_send(&key);
        tracer.on_send(&key);
        tracer.on_deliver(&key, 2);
        tracer.on_acquire(&key, AcquireKind::Joined);

        assert_eq!(tracer.send_count.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.deliver_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
