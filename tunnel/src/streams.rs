use std::sync::Arc;

use dashmap::DashMap;

/// Streams are grouped by the tunnel they currently ride on.
pub(crate) trait HasTid {
    fn tid(&self) -> &str;
}

/// The concurrent stream table: `sid -> stream`.
///
/// This is the only mechanism by which a tunnel's reader routes inbound
/// frames to per-stream consumers.
pub(crate) struct StreamTable<S> {
    inner: DashMap<String, Arc<S>>,
}

impl<S> StreamTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Idempotent: replaces and returns any existing entry so the caller can
    /// close its mailbox.
    pub(crate) fn insert(&self, sid: &str, stream: Arc<S>) -> Option<Arc<S>> {
        self.inner.insert(sid.to_owned(), stream)
    }

    pub(crate) fn get(&self, sid: &str) -> Option<Arc<S>> {
        self.inner.get(sid).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, sid: &str) -> Option<Arc<S>> {
        self.inner.remove(sid).map(|(_, stream)| stream)
    }

    /// Removes `stream` only if it is still the entry registered under `sid`,
    /// so evicting a stream never tears down its replacement.
    pub(crate) fn remove_entry(&self, sid: &str, stream: &Arc<S>) -> bool {
        self.inner
            .remove_if(sid, |_, current| Arc::ptr_eq(current, stream))
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn collect(&self, mut predicate: impl FnMut(&S) -> bool) -> Vec<Arc<S>> {
        self.inner
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl<S> StreamTable<S>
where
    S: HasTid,
{
    pub(crate) fn count_for(&self, tid: &str) -> usize {
        self.inner
            .iter()
            .filter(|entry| entry.value().tid() == tid)
            .count()
    }
}
