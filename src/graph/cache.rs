//! Bounded cache of fully-built graph templates, keyed by cuid.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::GraphTemplate;

/// LRU-bounded map from structural cuid to a sealed [`GraphTemplate`].
///
/// Long-running processes see an unbounded stream of shapes; the bound
/// keeps steady-state memory flat while the common case (a handful of
/// recurring shapes) always hits.
#[derive(Debug)]
pub struct GraphCache {
    inner: LruCache<u64, Arc<GraphTemplate>>,
}

impl GraphCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Look up a template, refreshing its recency on hit.
    pub fn get(&mut self, cuid: u64) -> Option<Arc<GraphTemplate>> {
        self.inner.get(&cuid).cloned()
    }

    /// Store a sealed template, evicting the least recently used entry
    /// if at capacity.
    pub fn insert(&mut self, cuid: u64, template: Arc<GraphTemplate>) {
        if self.inner.put(cuid, template).is_none() && self.inner.len() == self.inner.cap().get() {
            tracing::debug!(cuid, "graph cache at capacity");
        }
    }

    /// Wholesale invalidation, used when the owning communicator is
    /// torn down.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}
