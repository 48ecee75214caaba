//! Scheduled purging of expired entries.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{AbortHandle, Abortable};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hooks::{actions, Action, HookRouter};
use crate::store::Store;
use crate::time::now_millis;
use crate::value::Value;

/// Metadata recorded for the most recent sweep.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SweeperRun {
    /// Entries removed by the sweep
    pub count: usize,
    /// How long the sweep took
    pub duration: Duration,
    /// Wall-clock milliseconds when the sweep started
    pub started_at: u64,
}

/// The scheduled expirer for one cache.
///
/// Disabled entirely when the cache has no sweep interval; inspection then
/// returns [`Error::SweeperDisabled`].
#[derive(Clone, Debug)]
pub(crate) struct Sweeper {
    interval: Option<u64>,
    last_run: Arc<RwLock<Option<SweeperRun>>>,
    abort: Option<AbortHandle>,
}

impl Sweeper {
    /// Spawn the sweep task, or build a disabled sweeper when no interval
    /// is configured.
    pub(crate) fn start(
        name: Arc<str>,
        interval: Option<u64>,
        store: Arc<Store>,
        hooks: HookRouter,
    ) -> Self {
        let last_run = Arc::new(RwLock::new(None));
        let Some(millis) = interval else {
            return Sweeper {
                interval: None,
                last_run,
                abort: None,
            };
        };
        let period = Duration::from_millis(millis);
        let ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
        let (abort, abort_reg) = AbortHandle::new_pair();
        let runs = Arc::clone(&last_run);
        tokio::spawn(Abortable::new(
            ticks.for_each(move |_| {
                let name = Arc::clone(&name);
                let store = Arc::clone(&store);
                let hooks = hooks.clone();
                let runs = Arc::clone(&runs);
                async move {
                    let run = sweep(&store, &hooks).await;
                    if run.count > 0 {
                        debug!(cache = %name, count = run.count, "swept expired entries");
                    }
                    *runs.write().await = Some(run);
                }
            }),
            abort_reg,
        ));
        Sweeper {
            interval: Some(millis),
            last_run,
            abort: Some(abort),
        }
    }

    /// Metadata for the most recent sweep, `None` before the first tick.
    pub(crate) async fn last_run(&self) -> Result<Option<SweeperRun>> {
        if self.interval.is_none() {
            return Err(Error::SweeperDisabled);
        }
        Ok(self.last_run.read().await.clone())
    }

    /// Abort the sweep task, if one is running.
    pub(crate) fn stop(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// One full sweep: capture the clock, drop everything expired against it,
/// and broadcast a purge notification when anything was removed.
pub(crate) async fn sweep(store: &Store, hooks: &HookRouter) -> SweeperRun {
    let started_at = now_millis();
    let clock = std::time::Instant::now();
    let count = store.sweep_expired();
    if count > 0 {
        broadcast_purge(hooks, count).await;
    }
    SweeperRun {
        count,
        duration: clock.elapsed(),
        started_at,
    }
}

/// Announce that `count` entries were purged. Shared with the lazy-expiry
/// read path, which purges a single observed entry.
pub(crate) async fn broadcast_purge(hooks: &HookRouter, count: usize) {
    hooks.notify_pre(Action::new(actions::PURGE, Vec::new())).await;
    hooks
        .notify_post(Action::new(actions::PURGE, Vec::new()), Value::from(count as u64))
        .await;
}
