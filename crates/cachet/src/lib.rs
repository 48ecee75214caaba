#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(clippy::unwrap_used)]

/// [`Command`](crate::commands::Command) definitions for per-key
/// read/write transforms run through [`Cache::invoke`](crate::Cache::invoke)
pub mod commands;

/// Cache configuration ([`CacheConfig`](crate::config::CacheConfig)) and
/// per-call [`Options`](crate::config::Options)
pub mod config;

/// The stored [`Entry`](crate::entry::Entry) record and its expiration
/// arithmetic
pub mod entry;

/// The [`Error`](crate::error::Error) taxonomy surfaced by every operation
pub mod error;

/// The [`Hook`](crate::hooks::Hook) trait and notification plumbing
pub mod hooks;

/// [`Key`](crate::value::Key) and [`Value`](crate::value::Value) payload
/// types
pub mod value;

/// The [`Warmer`](crate::warm::Warmer) trait for populating caches at
/// start and on a schedule
pub mod warm;

mod cache;
mod locks;
mod registry;
mod singleflight;
mod store;
mod sweeper;
mod time;

pub use cache::Cache;
pub use commands::Command;
pub use config::{CacheConfig, CacheConfigBuilder, ExpirationPolicy, Options};
pub use entry::Entry;
pub use error::{Error, Result};
pub use hooks::{Action, ActionFilter, Hook, HookKind, Notification, Provision, ProvisionKind};
pub use singleflight::{FallbackResult, Fetched};
pub use sweeper::SweeperRun;
pub use value::{Key, Value};
pub use warm::{WarmPair, Warmer};
