//! Memoized typed results, keyed by query string.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::QueryString;
use crate::raw::RawResult;

struct Memo {
    /// The raw result the value was computed from.
    source: Arc<RawResult>,
    value: Arc<dyn Any + Send + Sync>,
}

/// Whether [`TransformCache::get_or_compute`] reused the memoized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoStatus {
    /// The memo matched the raw result and was reused.
    Hit,
    /// The transform ran and replaced any previous memo.
    Computed,
}

/// Cache of transformed results.
///
/// A memo is reused only if it was computed from the very same raw result
/// (`Arc` identity). A new delivery for the key therefore recomputes on next
/// access and overwrites the old memo.
///
/// Memos are kept per query string and output type, so a typed caller and a
/// JSON caller of the same query each keep their own value. Arguments that
/// affect a transform are expected to be part of the query string, so one
/// memo per key and type is safe to share between callers.
#[derive(Default)]
pub struct TransformCache {
    memos: Mutex<HashMap<(QueryString, TypeId), Memo, ahash::RandomState>>,
}

impl TransformCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the memoized value for `query_string`, or compute it from `raw`
    /// with `transform` and store it.
    ///
    /// The transform runs outside the lock. If two callers race on a fresh
    /// result, both compute and the later store wins; the transform is pure so
    /// the values are equal.
    pub fn get_or_compute<T, F>(
        &self,
        query_string: &QueryString,
        raw: &Arc<RawResult>,
        transform: F,
    ) -> (Arc<T>, MemoStatus)
    where
        T: Send + Sync + 'static,
        F: FnOnce(&RawResult) -> T,
    {
        if let Some(value) = self.lookup::<T>(query_string, raw) {
            return (value, MemoStatus::Hit);
        }

        let value = Arc::new(transform(raw));
        self.memos.lock().insert(
            (query_string.clone(), TypeId::of::<T>()),
            Memo {
                source: raw.clone(),
                value: value.clone(),
            },
        );
        (value, MemoStatus::Computed)
    }

    fn lookup<T: Send + Sync + 'static>(
        &self,
        query_string: &QueryString,
        raw: &Arc<RawResult>,
    ) -> Option<Arc<T>> {
        let memos = self.memos.lock();
        let memo = memos.get(&(query_string.clone(), TypeId::of::<T>()))?;
        if !Arc::ptr_eq(&memo.source, raw) {
            return None;
        }
        memo.value.clone().downcast::<T>().ok()
    }

    /// Forget every memo for a query string.
    pub fn invalidate(&self, query_string: &QueryString) -> bool {
        let mut memos = self.memos.lock();
        let before = memos.len();
        memos.retain(|(key, _), _| key != query_string);
        memos.len() != before
    }

    /// Number of memoized values, counting each output type separately.
    pub fn len(&self) -> usize {
        self.memos.lock().len()
    }

    /// Returns `true` if nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.memos.lock().is_empty()
    }
}

impl std::fmt::Debug for TransformCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCache")
            .field("memos", &self.len())
            .finish()
    }
}
