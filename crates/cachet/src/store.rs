//! The concurrent keyspace backing a cache.
//!
//! Reads go straight to the sharded map and never touch the transaction
//! queue; writes are atomic per key. Expiration is enforced at the read
//! boundary: an expired entry is never handed out, and when lazy expiry is
//! enabled the observing read also evicts it (guarded by the `modified`
//! stamp so a concurrent overwrite is preserved).

use dashmap::DashMap;

use crate::entry::Entry;
use crate::time::now_millis;
use crate::value::Key;

/// What a live (expiration-aware) read observed.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReadOutcome {
    /// A live entry
    Hit(Entry),
    /// No entry at all
    Miss,
    /// An expired entry was observed; `evicted` is set when the lazy path
    /// removed it
    Expired {
        /// whether the observing read deleted the entry
        evicted: bool,
    },
}

/// The sharded entry map for a single cache.
#[derive(Debug, Default)]
pub(crate) struct Store {
    map: DashMap<Key, Entry>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Store {
            map: DashMap::new(),
        }
    }

    /// Read the raw entry under `key`, expired or not.
    pub(crate) fn read(&self, key: &Key) -> Option<Entry> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Read the entry under `key`, enforcing the expiration invariant.
    ///
    /// Expired entries are reported as [`ReadOutcome::Expired`] and, when
    /// `lazy` is set, removed. Eviction is best-effort: if a writer
    /// replaced the entry after we observed it, the newer entry survives.
    pub(crate) fn read_live(&self, key: &Key, lazy: bool) -> ReadOutcome {
        // The shard guard must be dropped before the eviction below, so
        // the observed entry is cloned out first.
        let observed = match self.map.get(key) {
            Some(entry) => entry.value().clone(),
            None => return ReadOutcome::Miss,
        };
        let now = now_millis();
        if !observed.is_expired_at(now) {
            return ReadOutcome::Hit(observed);
        }
        if !lazy {
            return ReadOutcome::Expired { evicted: false };
        }
        let evicted = self.remove_if_modified(key, observed.modified);
        ReadOutcome::Expired { evicted }
    }

    /// Insert or overwrite an entry, returning the previous one.
    pub(crate) fn write(&self, entry: Entry) -> Option<Entry> {
        self.map.insert(entry.key.clone(), entry)
    }

    /// Mutate the entry under `key` in place. Returns false when absent.
    pub(crate) fn update<F>(&self, key: &Key, mutate: F) -> bool
    where
        F: FnOnce(&mut Entry),
    {
        match self.map.get_mut(key) {
            Some(mut entry) => {
                mutate(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Remove the entry under `key`. Returns whether one existed.
    pub(crate) fn delete(&self, key: &Key) -> bool {
        self.map.remove(key).is_some()
    }

    /// Remove and return the entry under `key`.
    pub(crate) fn take(&self, key: &Key) -> Option<Entry> {
        self.map.remove(key).map(|(_, entry)| entry)
    }

    /// Remove the entry under `key` only if its `modified` stamp still
    /// matches the one observed by the caller.
    pub(crate) fn remove_if_modified(&self, key: &Key, modified: u64) -> bool {
        self.map
            .remove_if(key, |_, entry| entry.modified == modified)
            .is_some()
    }

    /// Drop every entry, returning the pre-clear count.
    pub(crate) fn clear(&self) -> usize {
        let count = self.map.len();
        self.map.clear();
        count
    }

    /// Number of resident entries, expired ones included.
    pub(crate) fn size(&self) -> usize {
        self.map.len()
    }

    /// Number of resident entries that are live against a single captured
    /// clock reading.
    pub(crate) fn size_unexpired(&self) -> usize {
        let now = now_millis();
        self.map
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .count()
    }

    /// Snapshot of every resident key, expired ones included. Used by the
    /// streaming layer, which re-reads entries lazily and re-checks
    /// expiration at consumption time.
    pub(crate) fn keys_snapshot(&self) -> Vec<Key> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Keys and `modified` stamps of every entry expired against a single
    /// captured `now`. The stamp lets the purger delete exactly what it
    /// selected.
    pub(crate) fn select_expired(&self, now: u64) -> Vec<(Key, u64)> {
        self.map
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| (entry.key().clone(), entry.value().modified))
            .collect()
    }

    /// Delete everything expired against a single captured clock reading,
    /// returning the number of entries removed. Entries rewritten between
    /// selection and deletion are preserved.
    pub(crate) fn sweep_expired(&self) -> usize {
        let now = now_millis();
        self.select_expired(now)
            .into_iter()
            .filter(|(key, modified)| self.remove_if_modified(key, *modified))
            .count()
    }
}
