//! Key and payload types stored in a cache.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The dynamic payload type held by cache entries.
///
/// Values are JSON-shaped so that numeric operations ([`incr`], [`decr`])
/// and command transforms (list pops and friends) can inspect them without
/// the cache being generic over a payload type.
///
/// [`incr`]: crate::Cache::incr
/// [`decr`]: crate::Cache::decr
pub type Value = serde_json::Value;

/// A key in the keyspace.
///
/// Keys are hashable, equatable and cheap to clone. The common shapes used
/// at call sites (string slices, owned strings, integers, byte slices)
/// convert via `Into<Key>`, so `cache.get("answer")` and `cache.get(42)`
/// both work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// A UTF-8 string key
    Str(String),
    /// A signed integer key
    Int(i64),
    /// An opaque byte-string key
    Bytes(Vec<u8>),
}

impl Key {
    /// Render the key for structured log fields without allocating for the
    /// common string case.
    pub(crate) fn display(&self) -> Cow<'_, str> {
        match self {
            Key::Str(s) => Cow::Borrowed(s),
            Key::Int(i) => Cow::Owned(i.to_string()),
            Key::Bytes(b) => Cow::Owned(format!("{b:02x?}")),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key::Bytes(b)
    }
}
