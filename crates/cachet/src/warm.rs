//! Cache warmers: tasks that populate a cache at start and on a schedule.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{AbortHandle, Abortable};
use futures::StreamExt;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::Options;
use crate::value::{Key, Value};

/// A key/value pair produced by a warmer, with an optional per-pair TTL.
#[derive(Clone, Debug)]
pub struct WarmPair {
    /// The key to populate
    pub key: Key,
    /// The value to store
    pub value: Value,
    /// Lifetime in milliseconds; `None` falls back to the cache default
    pub expire: Option<u64>,
}

impl WarmPair {
    /// A pair stored with the cache's default TTL.
    pub fn new(key: impl Into<Key>, value: Value) -> Self {
        WarmPair {
            key: key.into(),
            value,
            expire: None,
        }
    }

    /// A pair stored with an explicit TTL.
    pub fn with_ttl(key: impl Into<Key>, value: Value, expire: u64) -> Self {
        WarmPair {
            key: key.into(),
            value,
            expire: Some(expire),
        }
    }
}

/// A source of warm data for a cache.
///
/// Required warmers complete at least once before `start` reports the
/// cache ready; the rest run asynchronously. A warmer with an interval is
/// re-executed on that schedule for the lifetime of the cache.
#[async_trait::async_trait]
pub trait Warmer: Send + Sync + 'static {
    /// A stable name used in logs.
    fn name(&self) -> &str;

    /// Re-run schedule. `None` means the warmer runs once at start.
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Whether cache start blocks on this warmer's first run.
    fn is_required(&self) -> bool {
        false
    }

    /// Produce pairs to store, or `None` to leave the cache untouched.
    async fn execute(&self, cache: &Cache) -> anyhow::Result<Option<Vec<WarmPair>>>;
}

/// Run a warmer once and apply whatever it produced.
pub(crate) async fn run_once(cache: &Cache, warmer: &Arc<dyn Warmer>) {
    match warmer.execute(cache).await {
        Ok(Some(pairs)) => {
            let count = pairs.len();
            for pair in pairs {
                let opts = match pair.expire {
                    Some(ttl) => Options::default().expire(ttl as i64),
                    None => Options::default(),
                };
                if let Err(e) = cache.put(pair.key, pair.value, opts).await {
                    warn!(warmer = warmer.name(), error = %e, "warmer write failed");
                }
            }
            debug!(warmer = warmer.name(), count, "warmer applied");
        }
        Ok(None) => {
            debug!(warmer = warmer.name(), "warmer produced nothing");
        }
        Err(e) => {
            warn!(warmer = warmer.name(), error = %e, "warmer execution failed");
        }
    }
}

/// Spawn the recurring schedule for a warmer, returning its abort handle.
/// The first scheduled run happens one full interval after start; the
/// initial population is handled separately by cache start.
pub(crate) fn spawn_schedule(cache: Cache, warmer: Arc<dyn Warmer>, period: Duration) -> AbortHandle {
    let (abort, abort_reg) = AbortHandle::new_pair();
    let ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
    tokio::spawn(Abortable::new(
        ticks.for_each(move |_| {
            let cache = cache.clone();
            let warmer = Arc::clone(&warmer);
            async move {
                run_once(&cache, &warmer).await;
            }
        }),
        abort_reg,
    ));
    abort
}
