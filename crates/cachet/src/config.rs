//! Cache configuration and per-call options.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::warm::Warmer;

/// How entries in a cache expire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationPolicy {
    /// Default TTL in milliseconds applied to writes that carry none
    pub default: Option<u64>,
    /// Sweep interval in milliseconds; `None` disables the sweeper
    pub interval: Option<u64>,
    /// Whether reads evict the expired entries they observe
    pub lazy: bool,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        ExpirationPolicy {
            default: None,
            interval: None,
            lazy: true,
        }
    }
}

/// Recognized per-call options.
///
/// Only a subset applies to any given operation; unrecognized combinations
/// are ignored rather than rejected, matching the write-mostly call sites.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// TTL override in milliseconds; negative means immediate eviction
    pub expire: Option<i64>,
    /// Starting value for `incr`/`decr` on a missing key (default 0)
    pub default: Option<i64>,
    /// Batch size for stream pagination
    pub buffer: Option<usize>,
}

impl Options {
    /// Options with every field unset.
    pub fn new() -> Self {
        Options::default()
    }

    /// Set the TTL override in milliseconds.
    pub fn expire(mut self, millis: i64) -> Self {
        self.expire = Some(millis);
        self
    }

    /// Set the starting value for numeric operations on a missing key.
    pub fn default_value(mut self, value: i64) -> Self {
        self.default = Some(value);
        self
    }

    /// Set the stream pagination batch size.
    pub fn buffer(mut self, size: usize) -> Self {
        self.buffer = Some(size);
        self
    }
}

/// Everything a cache is started with.
///
/// Build one through [`CacheConfig::builder`]; validation happens when the
/// cache starts.
#[derive(Clone)]
pub struct CacheConfig {
    /// Unique cache name within the process
    pub name: String,
    /// Expiration policy
    pub expiration: ExpirationPolicy,
    /// Whether the transaction machinery starts enabled
    pub transactions: bool,
    /// Backend hint; recorded on the cache record
    pub compressed: bool,
    /// Hooks in declaration order
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Warmers in declaration order
    pub warmers: Vec<Arc<dyn Warmer>>,
    /// Named commands available to `invoke`
    pub commands: HashMap<String, Command>,
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .field("transactions", &self.transactions)
            .field("compressed", &self.compressed)
            .field(
                "hooks",
                &self.hooks.iter().map(|h| h.name().to_string()).collect::<Vec<_>>(),
            )
            .field(
                "warmers",
                &self
                    .warmers
                    .iter()
                    .map(|w| w.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheConfig {
    /// Start building a configuration for the named cache.
    pub fn builder(name: impl Into<String>) -> CacheConfigBuilder {
        CacheConfigBuilder {
            config: CacheConfig {
                name: name.into(),
                expiration: ExpirationPolicy::default(),
                transactions: false,
                compressed: false,
                hooks: Vec::new(),
                warmers: Vec::new(),
                commands: HashMap::new(),
            },
        }
    }

    /// Check the configuration for caller errors.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidName);
        }
        if self.expiration.default == Some(0) {
            return Err(Error::InvalidOption("expiration.default"));
        }
        if self.expiration.interval == Some(0) {
            return Err(Error::InvalidOption("expiration.interval"));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Replace the whole expiration policy.
    pub fn expiration(mut self, policy: ExpirationPolicy) -> Self {
        self.config.expiration = policy;
        self
    }

    /// Default TTL in milliseconds for writes that carry none.
    pub fn default_ttl(mut self, millis: u64) -> Self {
        self.config.expiration.default = Some(millis);
        self
    }

    /// Enable the scheduled sweeper with the given interval.
    pub fn sweep_interval(mut self, millis: u64) -> Self {
        self.config.expiration.interval = Some(millis);
        self
    }

    /// Whether reads evict expired entries they observe. On by default.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.config.expiration.lazy = lazy;
        self
    }

    /// Start with the transaction machinery enabled instead of waiting for
    /// the first `transaction` call to flip it on.
    pub fn transactions(mut self, enabled: bool) -> Self {
        self.config.transactions = enabled;
        self
    }

    /// Record the compressed-backend hint.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.config.compressed = compressed;
        self
    }

    /// Attach a hook. Order of attachment is the order of notification.
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.config.hooks.push(hook);
        self
    }

    /// Attach a warmer.
    pub fn warmer(mut self, warmer: Arc<dyn Warmer>) -> Self {
        self.config.warmers.push(warmer);
        self
    }

    /// Register a named command for `invoke`.
    pub fn command(mut self, name: impl Into<String>, command: Command) -> Self {
        self.config.commands.insert(name.into(), command);
        self
    }

    /// Finish building.
    pub fn build(self) -> CacheConfig {
        self.config
    }
}
