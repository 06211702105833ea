//! Keyed registry of independently lockable entries.
//!
//! Load-or-store-with-initializer and conditional-replace-or-delete are
//! single, atomic operations from the perspective of other callers: the
//! entry lock is acquired while the registry lock is held, so a concurrent
//! "last handler removed, delete entry" and "new handler added" can never
//! both win.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct LockMap<V> {
    entries: Mutex<HashMap<String, Arc<Mutex<V>>>>,
}

/// An exclusively locked entry of a [`LockMap`].
pub struct LockedEntry<V> {
    cell: Arc<Mutex<V>>,
    guard: OwnedMutexGuard<V>,
}

impl<V> LockedEntry<V> {
    /// Shared handle to the entry, for callbacks that outlive this guard.
    pub fn cell(&self) -> Arc<Mutex<V>> {
        Arc::clone(&self.cell)
    }
}

impl<V> Deref for LockedEntry<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.guard
    }
}

impl<V> DerefMut for LockedEntry<V> {
    fn deref_mut(&mut self) -> &mut V {
        &mut self.guard
    }
}

impl<V: Send + 'static> LockMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Locks the entry under `key`, creating it with `init` when absent.
    ///
    /// Waiting on a contended entry lock stalls other registry operations;
    /// entry locks are expected to be held only for entry-local work plus
    /// that entry's own I/O.
    pub async fn lock_or_create(&self, key: &str, init: impl FnOnce() -> V) -> LockedEntry<V> {
        let mut entries = self.entries.lock().await;
        let cell = entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone();
        let guard = cell.clone().lock_owned().await;
        LockedEntry { cell, guard }
    }

    /// Locks the entry under `key`, or returns `None` when absent.
    pub async fn lock_existing(&self, key: &str) -> Option<LockedEntry<V>> {
        let entries = self.entries.lock().await;
        let cell = entries.get(key)?.clone();
        let guard = cell.clone().lock_owned().await;
        Some(LockedEntry { cell, guard })
    }

    /// Locks the entry under `key` and applies `decide`; when `decide`
    /// returns `true` the entry is removed from the registry before either
    /// lock is released. Returns `None` when no entry exists.
    pub async fn remove_if<R>(
        &self,
        key: &str,
        decide: impl FnOnce(&mut V) -> (bool, R),
    ) -> Option<R> {
        let mut entries = self.entries.lock().await;
        let cell = entries.get(key)?.clone();
        let mut guard = cell.lock_owned().await;
        let (remove, ret) = decide(&mut guard);
        if remove {
            entries.remove(key);
        }
        Some(ret)
    }

    /// Snapshot of all entries, for scans that lock one entry at a time.
    pub async fn snapshot(&self) -> Vec<(String, Arc<Mutex<V>>)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(key, cell)| (key.clone(), cell.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

impl<V: Send + 'static> Default for LockMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
