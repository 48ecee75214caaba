//! The public cache handle and its operations.
//!
//! A [`Cache`] is a cheap-to-clone handle carrying only the cache name;
//! every operation resolves the name through the process-global registry,
//! so a handle held across a `stop` observes `NoCache` rather than stale
//! state. Writes are gated through the cache's serial queue whenever they
//! would collide with a transaction holding row locks; everything else
//! runs directly against the keyspace.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::AbortHandle;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::commands::{Command, CommandTable};
use crate::config::{CacheConfig, ExpirationPolicy, Options};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::hooks::{actions, Action, HookRouter, Provision, ProvisionKind};
use crate::locks::TransactionQueue;
use crate::registry;
use crate::singleflight::{FallbackResult, Fetched, FlightJob, SingleFlight};
use crate::store::{ReadOutcome, Store};
use crate::sweeper::{broadcast_purge, Sweeper, SweeperRun};
use crate::time::now_millis;
use crate::value::{Key, Value};
use crate::warm::{self, Warmer};

/// Everything a running cache owns: configuration fixed at start plus
/// handles to its service tasks. Stored behind `Arc` in the registry.
#[derive(Clone)]
pub(crate) struct CacheRecord {
    pub(crate) name: Arc<str>,
    pub(crate) expiration: ExpirationPolicy,
    pub(crate) compressed: bool,
    pub(crate) store: Arc<Store>,
    pub(crate) hooks: HookRouter,
    pub(crate) commands: CommandTable,
    /// flips false -> true exactly once, on the first transaction
    pub(crate) transactions_enabled: Arc<AtomicBool>,
    pub(crate) queue: TransactionQueue,
    pub(crate) flight: SingleFlight,
    pub(crate) sweeper: Sweeper,
    pub(crate) warmers: Vec<Arc<dyn Warmer>>,
    pub(crate) warm_handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl fmt::Debug for CacheRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRecord")
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .field("compressed", &self.compressed)
            .field("size", &self.store.size())
            .field("warmers", &self.warmers.len())
            .finish_non_exhaustive()
    }
}

impl CacheRecord {
    pub(crate) fn transactions(&self) -> bool {
        self.transactions_enabled.load(Ordering::Acquire)
    }

    fn stop_services(&self) {
        self.sweeper.stop();
        self.queue.stop();
        self.flight.stop();
        self.hooks.stop();
        for handle in self
            .warm_handles
            .lock()
            .expect("warm handle lock poisoned")
            .iter()
        {
            handle.abort();
        }
    }
}

/// A handle to a running cache.
#[derive(Clone, Debug)]
pub struct Cache {
    name: Arc<str>,
}

/// Render an operation result for post hooks.
fn render_result<T: Serialize>(result: &Result<T>) -> Value {
    match result {
        Ok(value) => serde_json::to_value(value).unwrap_or(Value::Null),
        Err(error) => serde_json::json!({ "error": error.to_string() }),
    }
}

/// Render a key as an action argument.
fn key_arg(key: &Key) -> Value {
    serde_json::to_value(key).unwrap_or(Value::Null)
}

/// Wrap an operation in its pre/post hook notifications.
async fn act<T, Fut>(record: &CacheRecord, action: Action, op: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
    T: Serialize,
{
    record.hooks.notify_pre(action.clone()).await;
    let result = op.await;
    record.hooks.notify_post(action, render_result(&result)).await;
    result
}

/// TTL for a write: the per-call override, else the cache default.
fn merged_ttl(record: &CacheRecord, opts: Options) -> Option<i64> {
    opts.expire
        .or_else(|| record.expiration.default.map(|default| default as i64))
}

/// Split a live read into the entry (if any) and whether the read evicted
/// an expired entry on the way.
fn live_split(outcome: ReadOutcome) -> (Option<Entry>, bool) {
    match outcome {
        ReadOutcome::Hit(entry) => (Some(entry), false),
        ReadOutcome::Expired { evicted } => (None, evicted),
        ReadOutcome::Miss => (None, false),
    }
}

/// Read the live entry under `key`, broadcasting the single-entry purge
/// when the lazy path evicted an expired one.
async fn live_entry(record: &CacheRecord, key: &Key) -> Option<Entry> {
    let (live, evicted) = live_split(record.store.read_live(key, record.expiration.lazy));
    if evicted {
        broadcast_purge(&record.hooks, 1).await;
    }
    live
}

/// Build the write used by the single-flight executor to persist a
/// committed fallback value. The write respects the TTL chain (fallback
/// return, then per-call option, then cache default) and deliberately
/// emits no hook notifications.
fn commit_writer(
    record: &CacheRecord,
    key: Key,
    opts: Options,
) -> Box<dyn FnOnce(Value, Option<u64>) -> futures::future::BoxFuture<'static, ()> + Send> {
    let store = Arc::clone(&record.store);
    let queue = record.queue.clone();
    let name = Arc::clone(&record.name);
    let enabled = Arc::clone(&record.transactions_enabled);
    let default_ttl = record.expiration.default;
    Box::new(move |value, expire| {
        Box::pin(async move {
            let ttl = expire
                .map(|e| e as i64)
                .or(opts.expire)
                .or(default_ttl.map(|d| d as i64));
            let keys = [key.clone()];
            let written = match ttl {
                Some(t) if t < 0 => {
                    let target = key.clone();
                    queue
                        .write(&name, &keys, enabled.load(Ordering::Acquire), move || {
                            store.delete(&target);
                            Ok(())
                        })
                        .await
                }
                ttl => {
                    let entry = Entry::new(key.clone(), value, ttl.map(|t| t as u64));
                    queue
                        .write(&name, &keys, enabled.load(Ordering::Acquire), move || {
                            store.write(entry);
                            Ok(())
                        })
                        .await
                }
            };
            if let Err(e) = written {
                warn!(error = %e, "fetch commit write failed");
            }
        })
    })
}

impl Cache {
    /// Build a handle for a cache by name without checking liveness.
    pub(crate) fn from_name(name: Arc<str>) -> Self {
        Cache { name }
    }

    /// This cache's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a cache from its configuration and hand back a handle.
    ///
    /// The keyspace, hook mailboxes, transaction queue, single-flight
    /// executor and (when an interval is configured) the sweeper are all
    /// running once this returns, and every required warmer has completed
    /// its first pass.
    #[instrument(skip_all, fields(cache = %config.name))]
    pub async fn start(config: CacheConfig) -> Result<Cache> {
        config.validate()?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let store = Arc::new(Store::new());
        let hooks = HookRouter::start(&config.hooks);
        let sweeper = Sweeper::start(
            Arc::clone(&name),
            config.expiration.interval,
            Arc::clone(&store),
            hooks.clone(),
        );
        let record = Arc::new(CacheRecord {
            name: Arc::clone(&name),
            expiration: config.expiration,
            compressed: config.compressed,
            store,
            hooks,
            commands: CommandTable::new(config.commands),
            transactions_enabled: Arc::new(AtomicBool::new(config.transactions)),
            queue: TransactionQueue::start(),
            flight: SingleFlight::start(),
            sweeper,
            warmers: config.warmers.clone(),
            warm_handles: Arc::new(Mutex::new(Vec::new())),
        });
        if let Err(e) = registry::register(Arc::clone(&record)).await {
            record.stop_services();
            return Err(e);
        }
        let cache = Cache { name };

        // hooks that asked for the cache record get it as soon as we are
        // resolvable, and again on every registry update
        record
            .hooks
            .provision(ProvisionKind::Cache, Provision::Cache(cache.clone()))
            .await;

        let mut schedules = Vec::new();
        for warmer in &config.warmers {
            if warmer.is_required() {
                warm::run_once(&cache, warmer).await;
            } else {
                let cache = cache.clone();
                let warmer = Arc::clone(warmer);
                tokio::spawn(async move {
                    warm::run_once(&cache, &warmer).await;
                });
            }
            if let Some(period) = warmer.interval() {
                schedules.push(warm::spawn_schedule(
                    cache.clone(),
                    Arc::clone(warmer),
                    period,
                ));
            }
        }
        record
            .warm_handles
            .lock()
            .expect("warm handle lock poisoned")
            .extend(schedules);

        info!(cache = %cache.name, "cache started");
        Ok(cache)
    }

    /// Stop the cache: tear down its service tasks and unregister it.
    /// Handles left around observe [`Error::NoCache`] afterwards.
    #[instrument(skip_all, fields(cache = %self.name))]
    pub async fn stop(&self) -> Result<()> {
        let record = registry::unregister(&self.name).await.ok_or(Error::NoCache)?;
        record.stop_services();
        info!(cache = %self.name, "cache stopped");
        Ok(())
    }

    async fn record(&self) -> Result<Arc<CacheRecord>> {
        registry::retrieve(&self.name).await.ok_or(Error::NoCache)
    }

    /// Store `value` under `key`, overwriting value and TTL.
    pub async fn put(&self, key: impl Into<Key>, value: Value, opts: Options) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::PUT, vec![key_arg(&key), value.clone()]);
        act(&record, action, async {
            let keys = [key.clone()];
            match merged_ttl(&record, opts) {
                Some(ttl) if ttl < 0 => {
                    // a negative TTL is an eviction, not a write
                    let store = Arc::clone(&record.store);
                    let target = key.clone();
                    record
                        .queue
                        .write(&record.name, &keys, record.transactions(), move || {
                            store.delete(&target);
                            Ok(true)
                        })
                        .await
                }
                ttl => {
                    let store = Arc::clone(&record.store);
                    let entry = Entry::new(key.clone(), value.clone(), ttl.map(|t| t as u64));
                    record
                        .queue
                        .write(&record.name, &keys, record.transactions(), move || {
                            store.write(entry);
                            Ok(true)
                        })
                        .await
                }
            }
        })
        .await
    }

    /// Store a batch of pairs in one write. An empty batch is a no-op.
    pub async fn put_many<K: Into<Key>>(
        &self,
        pairs: impl IntoIterator<Item = (K, Value)>,
        opts: Options,
    ) -> Result<bool> {
        let record = self.record().await?;
        let pairs: Vec<(Key, Value)> = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        if pairs.is_empty() {
            return Ok(true);
        }
        let keys: Vec<Key> = pairs.iter().map(|(key, _)| key.clone()).collect();
        let action = Action::new(actions::PUT_MANY, keys.iter().map(key_arg).collect());
        act(&record, action, async {
            let ttl = merged_ttl(&record, opts);
            let store = Arc::clone(&record.store);
            record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    match ttl {
                        Some(t) if t < 0 => {
                            for (key, _) in pairs {
                                store.delete(&key);
                            }
                        }
                        ttl => {
                            let ttl = ttl.map(|t| t as u64);
                            for (key, value) in pairs {
                                store.write(Entry::new(key, value, ttl));
                            }
                        }
                    }
                    Ok(true)
                })
                .await
        })
        .await
    }

    /// Read the value under `key`, honoring lazy expiry.
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::GET, vec![key_arg(&key)]);
        act(&record, action, async {
            Ok(live_entry(&record, &key).await.map(|entry| entry.value))
        })
        .await
    }

    /// Atomically read and delete the value under `key`.
    pub async fn take(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::TAKE, vec![key_arg(&key)]);
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let target = key.clone();
            let taken = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    Ok(store.take(&target))
                })
                .await?;
            match taken {
                Some(entry) if entry.is_expired() => {
                    // removing an expired entry is a purge, not a take
                    broadcast_purge(&record.hooks, 1).await;
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.value)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Read the value under `key`, running `fallback` on a miss.
    ///
    /// Concurrent fetches of the same key share a single fallback
    /// execution: the caller whose miss started it observes
    /// [`Fetched::Commit`], everyone else the same value as
    /// [`Fetched::Ok`]. A committed value is written with the TTL chain
    /// (fallback return, per-call option, cache default) and without hook
    /// notifications for the write itself.
    #[instrument(skip_all, fields(cache = %self.name))]
    pub async fn fetch<F, Fut, R>(
        &self,
        key: impl Into<Key>,
        fallback: F,
        opts: Options,
    ) -> Result<Fetched>
    where
        F: FnOnce(Key) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<FallbackResult> + 'static,
    {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::FETCH, vec![key_arg(&key)]);
        act(&record, action, async {
            if let Some(entry) = live_entry(&record, &key).await {
                return Ok(Fetched::Ok(entry.value));
            }
            let work = {
                let key = key.clone();
                Box::pin(async move { fallback(key).await.map(Into::into) })
                    as futures::future::BoxFuture<'static, anyhow::Result<FallbackResult>>
            };
            let commit = commit_writer(&record, key.clone(), opts);
            record
                .flight
                .dispatch(key.clone(), FlightJob { work, commit })
                .await
        })
        .await
    }

    /// Read the current value, apply `update`, and write the result while
    /// preserving the entry's `modified` stamp and expiration. The closure
    /// may return [`FallbackResult::Ignore`] to skip the write.
    pub async fn get_and_update<F, R>(
        &self,
        key: impl Into<Key>,
        update: F,
        opts: Options,
    ) -> Result<Fetched>
    where
        F: FnOnce(Option<&Value>) -> R + Send + 'static,
        R: Into<FallbackResult> + 'static,
    {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::GET_AND_UPDATE, vec![key_arg(&key)]);
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let lazy = record.expiration.lazy;
            let fresh_ttl = merged_ttl(&record, opts);
            let target = key.clone();
            let (outcome, evicted) = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    let (live, evicted) = live_split(store.read_live(&target, lazy));
                    let result = update(live.as_ref().map(|entry| &entry.value)).into();
                    let outcome = match result {
                        FallbackResult::Commit { value, .. } => {
                            match live {
                                // mutation in place: the expiration clock
                                // does not restart
                                Some(_) => {
                                    store.update(&target, |entry| entry.value = value.clone());
                                }
                                None => match fresh_ttl {
                                    Some(t) if t < 0 => {}
                                    ttl => {
                                        store.write(Entry::new(
                                            target.clone(),
                                            value.clone(),
                                            ttl.map(|t| t as u64),
                                        ));
                                    }
                                },
                            }
                            Fetched::Commit(value)
                        }
                        FallbackResult::Ignore(value) => Fetched::Ignore(value),
                    };
                    Ok((outcome, evicted))
                })
                .await?;
            if evicted {
                broadcast_purge(&record.hooks, 1).await;
            }
            Ok(outcome)
        })
        .await
    }

    /// Blind overwrite of the value under `key`, preserving TTL and the
    /// `modified` stamp. Returns false when the key is absent.
    pub async fn update(&self, key: impl Into<Key>, value: Value) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::UPDATE, vec![key_arg(&key), value.clone()]);
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let lazy = record.expiration.lazy;
            let target = key.clone();
            let (updated, evicted) = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    let (live, evicted) = live_split(store.read_live(&target, lazy));
                    let updated = match live {
                        Some(_) => store.update(&target, |entry| entry.value = value.clone()),
                        None => false,
                    };
                    Ok((updated, evicted))
                })
                .await?;
            if evicted {
                broadcast_purge(&record.hooks, 1).await;
            }
            Ok(updated)
        })
        .await
    }

    /// Atomically add `amount` to the integer under `key`, starting from
    /// the `default` option (or zero) when the key is missing.
    pub async fn incr(&self, key: impl Into<Key>, amount: i64, opts: Options) -> Result<i64> {
        self.numeric_op(actions::INCR, key.into(), amount, opts).await
    }

    /// Atomically subtract `amount` from the integer under `key`.
    pub async fn decr(&self, key: impl Into<Key>, amount: i64, opts: Options) -> Result<i64> {
        self.numeric_op(actions::DECR, key.into(), -amount, opts).await
    }

    async fn numeric_op(
        &self,
        name: &'static str,
        key: Key,
        amount: i64,
        opts: Options,
    ) -> Result<i64> {
        let record = self.record().await?;
        let action = Action::new(name, vec![key_arg(&key), Value::from(amount)]);
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let lazy = record.expiration.lazy;
            let fresh_ttl = merged_ttl(&record, opts);
            let target = key.clone();
            let (next, evicted) = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    let (live, evicted) = live_split(store.read_live(&target, lazy));
                    match live {
                        Some(entry) => {
                            let current =
                                entry.value.as_i64().ok_or(Error::NonNumericValue)?;
                            let next = current + amount;
                            store.update(&target, |entry| entry.value = Value::from(next));
                            Ok((next, evicted))
                        }
                        None => {
                            let next = opts.default.unwrap_or(0) + amount;
                            match fresh_ttl {
                                Some(t) if t < 0 => {}
                                ttl => {
                                    store.write(Entry::new(
                                        target.clone(),
                                        Value::from(next),
                                        ttl.map(|t| t as u64),
                                    ));
                                }
                            }
                            Ok((next, evicted))
                        }
                    }
                })
                .await?;
            if evicted {
                broadcast_purge(&record.hooks, 1).await;
            }
            Ok(next)
        })
        .await
    }

    /// Set or clear the TTL under `key`. `None` persists the entry,
    /// a non-positive TTL deletes it immediately. Returns false when the
    /// key is absent.
    pub async fn expire(&self, key: impl Into<Key>, ttl: Option<i64>) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(
            actions::EXPIRE,
            vec![key_arg(&key), ttl.map(Value::from).unwrap_or(Value::Null)],
        );
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let lazy = record.expiration.lazy;
            let target = key.clone();
            let (changed, evicted) = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    let (live, evicted) = live_split(store.read_live(&target, lazy));
                    if live.is_none() {
                        return Ok((false, evicted));
                    }
                    let changed = match ttl {
                        Some(t) if t <= 0 => store.delete(&target),
                        Some(t) => store.update(&target, |entry| {
                            entry.expiration = Some(t as u64);
                            entry.modified = now_millis();
                        }),
                        None => store.update(&target, |entry| entry.expiration = None),
                    };
                    Ok((changed, evicted))
                })
                .await?;
            if evicted {
                broadcast_purge(&record.hooks, 1).await;
            }
            Ok(changed)
        })
        .await
    }

    /// Expire the entry at an absolute wall-clock instant (milliseconds
    /// since the Unix epoch). Sugar over [`Cache::expire`].
    pub async fn expire_at(&self, key: impl Into<Key>, instant: u64) -> Result<bool> {
        let remaining = instant as i64 - now_millis() as i64;
        self.expire(key, Some(remaining)).await
    }

    /// Remove any TTL from the entry under `key`.
    pub async fn persist(&self, key: impl Into<Key>) -> Result<bool> {
        self.expire(key, None).await
    }

    /// Restart the entry's expiration clock: after a refresh the remaining
    /// TTL equals the originally configured TTL.
    pub async fn refresh(&self, key: impl Into<Key>) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::REFRESH, vec![key_arg(&key)]);
        self.stamp_op(&record, action, key, |entry, now| {
            entry.modified = now;
        })
        .await
    }

    /// Re-stamp the entry as modified now while shrinking its TTL by the
    /// elapsed time, leaving the absolute expiry instant unchanged.
    pub async fn touch(&self, key: impl Into<Key>) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::TOUCH, vec![key_arg(&key)]);
        self.stamp_op(&record, action, key, |entry, now| {
            let elapsed = now.saturating_sub(entry.modified);
            if let Some(expiration) = entry.expiration {
                entry.expiration = Some(expiration.saturating_sub(elapsed));
            }
            entry.modified = now;
        })
        .await
    }

    /// Shared body of `refresh` and `touch`: a live-gated in-place stamp
    /// rewrite.
    async fn stamp_op<F>(
        &self,
        record: &CacheRecord,
        action: Action,
        key: Key,
        stamp: F,
    ) -> Result<bool>
    where
        F: Fn(&mut Entry, u64) + Send + 'static,
    {
        act(record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let lazy = record.expiration.lazy;
            let target = key.clone();
            let (changed, evicted) = record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    let (live, evicted) = live_split(store.read_live(&target, lazy));
                    if live.is_none() {
                        return Ok((false, evicted));
                    }
                    let now = now_millis();
                    let changed = store.update(&target, |entry| stamp(entry, now));
                    Ok((changed, evicted))
                })
                .await?;
            if evicted {
                broadcast_purge(&record.hooks, 1).await;
            }
            Ok(changed)
        })
        .await
    }

    /// Remaining lifetime of the entry under `key` in milliseconds;
    /// `Ok(None)` when the key is absent or the entry never expires.
    pub async fn ttl(&self, key: impl Into<Key>) -> Result<Option<u64>> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::TTL, vec![key_arg(&key)]);
        act(&record, action, async {
            Ok(live_entry(&record, &key)
                .await
                .and_then(|entry| entry.remaining_ttl()))
        })
        .await
    }

    /// Delete the entry under `key`.
    pub async fn del(&self, key: impl Into<Key>) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::DEL, vec![key_arg(&key)]);
        act(&record, action, async {
            let keys = [key.clone()];
            let store = Arc::clone(&record.store);
            let target = key.clone();
            record
                .queue
                .write(&record.name, &keys, record.transactions(), move || {
                    store.delete(&target);
                    Ok(true)
                })
                .await
        })
        .await
    }

    /// Drop every entry, returning how many were resident beforehand.
    pub async fn clear(&self) -> Result<usize> {
        let record = self.record().await?;
        let action = Action::new(actions::CLEAR, Vec::new());
        act(&record, action, async { Ok(record.store.clear()) }).await
    }

    /// Number of resident entries, including expired ones the sweeper has
    /// not visited yet.
    pub async fn size(&self) -> Result<usize> {
        let record = self.record().await?;
        let action = Action::new(actions::SIZE, Vec::new());
        act(&record, action, async { Ok(record.store.size()) }).await
    }

    /// Number of resident entries that are actually live.
    pub async fn size_unexpired(&self) -> Result<usize> {
        let record = self.record().await?;
        let action = Action::new(actions::SIZE, vec![Value::from("unexpired")]);
        act(&record, action, async { Ok(record.store.size_unexpired()) }).await
    }

    /// Whether the cache holds no live entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size_unexpired().await? == 0)
    }

    /// Whether a live entry exists under `key`.
    pub async fn exists(&self, key: impl Into<Key>) -> Result<bool> {
        let record = self.record().await?;
        let key = key.into();
        let action = Action::new(actions::EXISTS, vec![key_arg(&key)]);
        act(&record, action, async {
            Ok(live_entry(&record, &key).await.is_some())
        })
        .await
    }

    /// Every key with a live entry.
    pub async fn keys(&self) -> Result<Vec<Key>> {
        let record = self.record().await?;
        let action = Action::new(actions::KEYS, Vec::new());
        act(&record, action, async {
            let now = now_millis();
            Ok(record
                .store
                .keys_snapshot()
                .into_iter()
                .filter(|key| {
                    record
                        .store
                        .read(key)
                        .is_some_and(|entry| !entry.is_expired_at(now))
                })
                .collect())
        })
        .await
    }

    /// Stream the live entries of the cache.
    ///
    /// The key set is snapshotted up front; entries are read back in
    /// `buffer`-sized batches as the stream is consumed, skipping whatever
    /// expired or disappeared in the meantime. Iteration tolerates
    /// concurrent mutation.
    pub async fn stream(&self, opts: Options) -> Result<impl Stream<Item = Entry> + Send> {
        let record = self.record().await?;
        let action = Action::new(actions::STREAM, Vec::new());
        record.hooks.notify_pre(action.clone()).await;
        let buffer = opts.buffer.unwrap_or(25).max(1);
        let chunks: Vec<Vec<Key>> = record
            .store
            .keys_snapshot()
            .chunks(buffer)
            .map(<[Key]>::to_vec)
            .collect();
        let store = Arc::clone(&record.store);
        let entries = futures::stream::iter(chunks).flat_map(move |chunk| {
            let store = Arc::clone(&store);
            futures::stream::iter(chunk.into_iter().filter_map(move |key| {
                store.read(&key).filter(|entry| !entry.is_expired())
            }))
        });
        record.hooks.notify_post(action, Value::Null).await;
        Ok(entries)
    }

    /// Immediately drop every expired entry, exactly as a sweeper tick
    /// would, returning how many were removed.
    pub async fn purge(&self) -> Result<usize> {
        let record = self.record().await?;
        let action = Action::new(actions::PURGE, Vec::new());
        act(&record, action, async { Ok(record.store.sweep_expired()) }).await
    }

    /// Run `body` against this cache without re-resolving the registry
    /// between operations. Purely a batching construct: other writers
    /// interleave freely.
    pub async fn execute<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Cache) -> Fut,
        Fut: Future<Output = T>,
    {
        let record = self.record().await?;
        record
            .hooks
            .notify_pre(Action::new(actions::EXECUTE, Vec::new()))
            .await;
        let out = body(self.clone()).await;
        record
            .hooks
            .notify_post(Action::new(actions::EXECUTE, Vec::new()), Value::Null)
            .await;
        Ok(out)
    }

    /// Run `body` as a transaction holding row locks over `keys`.
    ///
    /// Transactions on one cache serialize against each other; writes to
    /// the locked keys from outside are delayed until the transaction has
    /// drained. The first call on a cache flips the transaction machinery
    /// on, permanently. A panicking body yields [`Error::Transaction`]
    /// with its locks released and without rolling back completed writes.
    #[instrument(skip_all, fields(cache = %self.name))]
    pub async fn transaction<F, Fut, T>(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Cache) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let record = self.record().await?;
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        if !record.transactions() {
            // monotonic flip, serialized through the registry so it is
            // observable before the transaction runs
            registry::update(&self.name, |current| {
                current.transactions_enabled.store(true, Ordering::Release);
                current.clone()
            })
            .await?;
            debug!(cache = %self.name, "transactions enabled");
        }
        let action = Action::new(actions::TRANSACTION, keys.iter().map(key_arg).collect());
        record.hooks.notify_pre(action.clone()).await;
        let handle = self.clone();
        let result = record
            .queue
            .transaction(Arc::clone(&record.name), keys, move || {
                let fut = body(handle);
                async move { Ok(fut.await) }
            })
            .await;
        let rendered = match &result {
            Ok(_) => Value::Null,
            Err(error) => serde_json::json!({ "error": error.to_string() }),
        };
        record.hooks.notify_post(action, rendered).await;
        result
    }

    /// Invoke a named command registered at start.
    ///
    /// Read commands transform the live value (or `Value::Null` when
    /// absent) into a reply. Write commands additionally produce a new
    /// value; an unchanged value skips the write entirely, and a changed
    /// one replaces the value field only, leaving the entry's stamps
    /// untouched.
    pub async fn invoke(&self, command: &str, key: impl Into<Key>) -> Result<Value> {
        let record = self.record().await?;
        let key = key.into();
        let found = record
            .commands
            .find(command)
            .cloned()
            .ok_or(Error::InvalidCommand)?;
        let action = Action::new(
            actions::INVOKE,
            vec![Value::from(command.to_string()), key_arg(&key)],
        );
        act(&record, action, async {
            match found {
                Command::Read(transform) => {
                    let current = live_entry(&record, &key)
                        .await
                        .map(|entry| entry.value)
                        .unwrap_or(Value::Null);
                    Ok(transform(&current))
                }
                Command::Write(transform) => {
                    let keys = [key.clone()];
                    let store = Arc::clone(&record.store);
                    let lazy = record.expiration.lazy;
                    let fresh_ttl = merged_ttl(&record, Options::default());
                    let target = key.clone();
                    let (reply, evicted) = record
                        .queue
                        .write(&record.name, &keys, record.transactions(), move || {
                            let (live, evicted) = live_split(store.read_live(&target, lazy));
                            let current = live
                                .as_ref()
                                .map(|entry| entry.value.clone())
                                .unwrap_or(Value::Null);
                            let (reply, next) = transform(&current);
                            match live {
                                Some(entry) if entry.value == next => {
                                    // unchanged value: skip the write so
                                    // the modified stamp is untouched
                                }
                                Some(_) => {
                                    store.update(&target, |entry| entry.value = next.clone());
                                }
                                None => {
                                    if next != Value::Null {
                                        store.write(Entry::new(
                                            target.clone(),
                                            next.clone(),
                                            fresh_ttl.and_then(|t| u64::try_from(t).ok()),
                                        ));
                                    }
                                }
                            }
                            Ok((reply, evicted))
                        })
                        .await?;
                    if evicted {
                        broadcast_purge(&record.hooks, 1).await;
                    }
                    Ok(reply)
                }
            }
        })
        .await
    }

    /// Re-run every warmer attached to this cache immediately, returning
    /// how many ran. Recurring warmers keep their schedules untouched.
    pub async fn warm(&self) -> Result<usize> {
        let record = self.record().await?;
        let action = Action::new(actions::WARM, Vec::new());
        act(&record, action, async {
            for warmer in &record.warmers {
                warm::run_once(self, warmer).await;
            }
            Ok(record.warmers.len())
        })
        .await
    }

    /// The raw entry under `key`, stamps included, with no expiry
    /// filtering and no lazy eviction. Inspection only.
    pub async fn entry(&self, key: impl Into<Key>) -> Result<Option<Entry>> {
        let record = self.record().await?;
        Ok(record.store.read(&key.into()))
    }

    /// Metadata for the most recent scheduled sweep, or
    /// [`Error::SweeperDisabled`] when the cache has no sweep interval.
    pub async fn last_sweep(&self) -> Result<Option<SweeperRun>> {
        let record = self.record().await?;
        record.sweeper.last_run().await
    }

    /// Whether this cache is currently registered.
    pub async fn is_running(&self) -> bool {
        registry::is_known(&self.name).await
    }

    /// The compressed-backend hint this cache was started with.
    pub async fn is_compressed(&self) -> Result<bool> {
        Ok(self.record().await?.compressed)
    }
}
