//! The error taxonomy surfaced at the crate boundary.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by cache operations.
///
/// Caller errors and entry errors are returned without any state change.
/// [`Error::Fallback`] and [`Error::Transaction`] carry failures captured
/// from user-supplied closures; nothing is retried automatically.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The named cache is not registered in this process
    #[error("specified cache is not running")]
    NoCache,
    /// The cache name is empty or already taken
    #[error("invalid cache name provided")]
    InvalidName,
    /// A cache is already registered under this name
    #[error("cache is already started")]
    AlreadyStarted,
    /// A configuration or per-call option failed validation
    #[error("invalid option provided: {0}")]
    InvalidOption(&'static str),
    /// `invoke` was called with an unknown or malformed command
    #[error("invalid command provided")]
    InvalidCommand,
    /// A fallback function of an unsupported shape was provided
    #[error("invalid fallback function provided")]
    InvalidFallback,
    /// A stream query could not be compiled into a filter
    #[error("invalid match specification provided")]
    InvalidMatch,
    /// A batch write was handed something other than key/value pairs
    #[error("invalid pairs provided")]
    InvalidPairs,
    /// A numeric operation found a non-integer value under the key
    #[error("operation requires a numeric value")]
    NonNumericValue,
    /// Sweeper inspection was requested but no sweep interval is configured
    #[error("expiration sweeper is not running")]
    SweeperDisabled,
    /// Statistics were requested but no stats hook is attached
    #[error("stats are not enabled for the cache")]
    StatsDisabled,
    /// A service this operation relies on has not been started
    #[error("cache service has not been started")]
    NotStarted,
    /// A fallback raised while computing a value; nothing was written
    #[error("fallback failed: {message}")]
    Fallback {
        /// The panic payload or error message raised by the fallback
        message: String,
        /// A backtrace captured at the dispatch site
        trace: String,
    },
    /// A transaction closure failed; locks were released, writes already
    /// applied by the closure are kept
    #[error("transaction failed: {0}")]
    Transaction(String),
}
