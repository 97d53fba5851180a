//! Request cache: deduplication of in-flight fetches and replay of completed
//! results, keyed by query string.
//!
//! Every operation runs as a single critical section, so the check-and-set in
//! [`RequestCache::acquire`] is what guarantees at most one in-flight request
//! per query string. Waiter callbacks always run after the lock is released,
//! which lets a waiter re-enter the cache (e.g. to issue a follow-up query).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ErrorPolicy;
use crate::key::QueryString;
use crate::raw::RawResult;
use crate::tracer::AcquireKind;

/// Callback awaiting the next raw result for a query string.
pub type Waiter = Box<dyn FnOnce(Arc<RawResult>) + Send>;

/// Identifies a registered waiter so its owner can withdraw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

/// Fetch state of a cache entry.
///
/// There is no "complete" state: `Idle` with a stored result means complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchState {
    /// No request is outstanding.
    Idle,
    /// A request was sent and its result has not arrived yet.
    Fetching,
}

/// Outcome of [`RequestCache::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The cached result was handed to the waiter before returning. Do not
    /// send.
    Replayed,
    /// A request for this query string is already in flight; the waiter was
    /// queued behind it. Do not send.
    Joined(WaiterId),
    /// The entry moved to `Fetching` and the waiter was queued. The caller
    /// must send the request.
    Started(WaiterId),
}

impl Acquired {
    /// Returns `true` if the waiter already received its result.
    pub fn already_resolved(&self) -> bool {
        matches!(self, Acquired::Replayed)
    }

    /// Returns `true` if the caller is responsible for sending the request.
    pub fn must_send(&self) -> bool {
        matches!(self, Acquired::Started(_))
    }

    /// The queued waiter, if the result is still pending.
    pub fn waiter(&self) -> Option<WaiterId> {
        match self {
            Acquired::Replayed => None,
            Acquired::Joined(id) | Acquired::Started(id) => Some(*id),
        }
    }

    /// Classification for tracing.
    pub fn kind(&self) -> AcquireKind {
        match self {
            Acquired::Replayed => AcquireKind::Replayed,
            Acquired::Joined(_) => AcquireKind::Joined,
            Acquired::Started(_) => AcquireKind::Started,
        }
    }
}

/// A waiter was removed by [`RequestCache::cancel_waiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Withdrawn {
    /// Waiters still queued on the entry.
    pub remaining: usize,
    /// Fetch state of the entry, unchanged by the withdrawal.
    pub fetch_state: FetchState,
}

/// Point-in-time copy of a cache entry's state.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// The key.
    pub query_string: QueryString,
    /// Whether a request is outstanding.
    pub fetch_state: FetchState,
    /// Last raw result received for this key.
    pub last_result: Option<Arc<RawResult>>,
    /// When the last result was stored.
    pub last_result_at: Option<Instant>,
    /// Number of queued waiters.
    pub waiters: usize,
}

struct CacheEntry {
    fetch_state: FetchState,
    last_result: Option<Arc<RawResult>>,
    last_result_at: Option<Instant>,
    /// Insertion order is notification order.
    waiters: Vec<(WaiterId, Waiter)>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            fetch_state: FetchState::Idle,
            last_result: None,
            last_result_at: None,
            waiters: Vec::new(),
        }
    }

    fn snapshot(&self, query_string: &QueryString) -> EntrySnapshot {
        EntrySnapshot {
            query_string: query_string.clone(),
            fetch_state: self.fetch_state,
            last_result: self.last_result.clone(),
            last_result_at: self.last_result_at,
            waiters: self.waiters.len(),
        }
    }
}

/// Cache of raw results keyed by query string.
///
/// One instance per client session. Entries are never evicted implicitly;
/// each distinct query string stays for the session unless [`evict`] is
/// called.
///
/// [`evict`]: RequestCache::evict
pub struct RequestCache {
    entries: Mutex<HashMap<QueryString, CacheEntry, ahash::RandomState>>,
    next_waiter: AtomicU64,
    error_policy: ErrorPolicy,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new(ErrorPolicy::default())
    }
}

impl RequestCache {
    /// Create an empty cache.
    pub fn new(error_policy: ErrorPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
            next_waiter: AtomicU64::new(0),
            error_policy,
        }
    }

    /// The policy applied to cached backend errors.
    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    fn replayable(&self, result: &RawResult) -> bool {
        match self.error_policy {
            ErrorPolicy::Retain => true,
            ErrorPolicy::RetryOnAcquire => !result.is_error(),
        }
    }

    /// Get the entry for a query string, creating an empty `Idle` one if
    /// absent.
    pub fn get_or_create(&self, query_string: &QueryString) -> EntrySnapshot {
        let mut entries = self.entries.lock();
        entries
            .entry(query_string.clone())
            .or_insert_with(CacheEntry::new)
            .snapshot(query_string)
    }

    /// Get the entry for a query string without creating it.
    pub fn snapshot(&self, query_string: &QueryString) -> Option<EntrySnapshot> {
        let entries = self.entries.lock();
        entries
            .get(query_string)
            .map(|entry| entry.snapshot(query_string))
    }

    /// Register interest in the result for `query_string`.
    ///
    /// - `Idle` with a replayable result: `waiter` is invoked with it before
    ///   this returns ([`Acquired::Replayed`]).
    /// - `Fetching`: `waiter` is queued ([`Acquired::Joined`]).
    /// - `Idle` without a result: the entry moves to `Fetching` and `waiter`
    ///   is queued ([`Acquired::Started`]); the caller must send.
    pub fn acquire(&self, query_string: &QueryString, waiter: Waiter) -> Acquired {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(query_string.clone())
            .or_insert_with(CacheEntry::new);

        if entry.fetch_state == FetchState::Idle {
            let cached = entry
                .last_result
                .as_ref()
                .filter(|result| self.replayable(result))
                .cloned();
            if let Some(result) = cached {
                drop(entries);
                trace!(query = %query_string, "replaying cached result");
                waiter(result);
                return Acquired::Replayed;
            }
        }

        let id = WaiterId(self.next_waiter.fetch_add(1, Ordering::Relaxed));
        entry.waiters.push((id, waiter));
        match entry.fetch_state {
            FetchState::Fetching => {
                trace!(query = %query_string, waiters = entry.waiters.len(), "joined in-flight fetch");
                Acquired::Joined(id)
            }
            FetchState::Idle => {
                entry.fetch_state = FetchState::Fetching;
                debug!(query = %query_string, "starting fetch");
                Acquired::Started(id)
            }
        }
    }

    /// Store a result for `query_string` and notify every queued waiter, in
    /// registration order. Returns the number of waiters notified.
    ///
    /// The result is stored even when nobody is waiting, including for keys
    /// that were never acquired.
    pub fn deliver(&self, query_string: &QueryString, result: Arc<RawResult>) -> usize {
        let waiters = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(query_string.clone())
                .or_insert_with(CacheEntry::new);
            if entry.fetch_state == FetchState::Idle {
                debug!(query = %query_string, "storing unsolicited result");
            }
            entry.fetch_state = FetchState::Idle;
            entry.last_result = Some(result.clone());
            entry.last_result_at = Some(Instant::now());
            std::mem::take(&mut entry.waiters)
        };

        let notified = waiters.len();
        trace!(query = %query_string, waiters = notified, error = result.is_error(), "delivering result");
        for (_, waiter) in waiters {
            waiter(result.clone());
        }
        notified
    }

    /// Remove one waiter without touching the fetch state or other waiters.
    ///
    /// Withdrawing the last waiter does not cancel the fetch; its result is
    /// still stored when it arrives. Returns `None` if the waiter was not
    /// queued (already notified, or already withdrawn).
    pub fn cancel_waiter(&self, query_string: &QueryString, waiter: WaiterId) -> Option<Withdrawn> {
        let removed;
        let withdrawn = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(query_string)?;
            let position = entry.waiters.iter().position(|(id, _)| *id == waiter)?;
            removed = entry.waiters.remove(position);
            Withdrawn {
                remaining: entry.waiters.len(),
                fetch_state: entry.fetch_state,
            }
        };
        // The callback is dropped here, outside the lock.
        drop(removed);
        trace!(query = %query_string, remaining = withdrawn.remaining, "withdrew waiter");
        Some(withdrawn)
    }

    /// Query strings with a request outstanding.
    ///
    /// After a reconnect, each of these must be sent again; their results
    /// would otherwise never arrive.
    pub fn in_flight(&self) -> Vec<QueryString> {
        let entries = self.entries.lock();
        let mut keys: Vec<_> = entries
            .iter()
            .filter(|(_, entry)| entry.fetch_state == FetchState::Fetching)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Remove an `Idle` entry, forgetting its result so the next `acquire`
    /// fetches again. Entries with a request in flight are kept.
    ///
    /// Returns `true` if an entry was removed.
    pub fn evict(&self, query_string: &QueryString) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(query_string) {
            Some(entry) if entry.fetch_state == FetchState::Idle => {
                entries.remove(query_string);
                debug!(query = %query_string, "evicted entry");
                true
            }
            _ => false,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache")
            .field("entries", &self.len())
            .field("error_policy", &self.error_policy)
            .finish()
    }
}
