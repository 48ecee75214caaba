//! The entry record stored in the keyspace.

use serde::{Deserialize, Serialize};

use crate::time::now_millis;
use crate::value::{Key, Value};

/// A single record in a cache.
///
/// An entry is expired iff it carries an expiration AND
/// `modified + expiration` is in the past. Expired entries may remain
/// resident until a lazy read observes them or the sweeper removes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The key this entry is stored under
    pub key: Key,
    /// Wall-clock milliseconds at the last write or touch
    pub modified: u64,
    /// Optional lifetime in milliseconds, relative to `modified`
    pub expiration: Option<u64>,
    /// The stored payload
    pub value: Value,
}

impl Entry {
    /// Create an entry stamped with the current time.
    pub fn new(key: Key, value: Value, expiration: Option<u64>) -> Self {
        Entry {
            key,
            modified: now_millis(),
            expiration,
            value,
        }
    }

    /// Whether this entry is expired when judged against `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.expiration, Some(exp) if self.modified + exp < now)
    }

    /// Whether this entry is expired right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Remaining lifetime in milliseconds, `None` when the entry never
    /// expires. An already-expired entry reports zero.
    pub fn remaining_ttl_at(&self, now: u64) -> Option<u64> {
        self.expiration
            .map(|exp| (self.modified + exp).saturating_sub(now))
    }

    /// Remaining lifetime judged against the current clock.
    pub fn remaining_ttl(&self) -> Option<u64> {
        self.remaining_ttl_at(now_millis())
    }
}
