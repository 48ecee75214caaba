//! Coalesced fallback execution.
//!
//! A `fetch` miss is dispatched here. The first miss for a key spawns a
//! worker running the fallback; every concurrent miss for the same key is
//! queued behind that worker instead of spawning its own. When the worker
//! finishes, committed values are written through the ordinary write path
//! (minus hook notifications), then every queued caller receives the
//! result: the caller whose miss spawned the worker keeps the original
//! commit/ignore tag, everybody after it sees commit demoted to ok, so
//! exactly one caller observes that it loaded the value.

use std::backtrace::Backtrace;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::stream::{AbortHandle, Abortable};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::{Error, Result};
use crate::locks::panic_message;
use crate::value::{Key, Value};

/// The normalized return of a fallback function.
#[derive(Clone, Debug, PartialEq)]
pub enum FallbackResult {
    /// Store the value, optionally with an explicit TTL in milliseconds
    Commit {
        /// the value to store and hand back
        value: Value,
        /// TTL override carried in the fallback return
        expire: Option<u64>,
    },
    /// Hand the value back without storing it
    Ignore(Value),
}

impl FallbackResult {
    /// Commit with the cache's TTL rules.
    pub fn commit(value: Value) -> Self {
        FallbackResult::Commit {
            value,
            expire: None,
        }
    }

    /// Commit with an explicit TTL in milliseconds.
    pub fn commit_with_ttl(value: Value, expire: u64) -> Self {
        FallbackResult::Commit {
            value,
            expire: Some(expire),
        }
    }

    /// Hand back without storing.
    pub fn ignore(value: Value) -> Self {
        FallbackResult::Ignore(value)
    }
}

/// A bare value commits with no options.
impl From<Value> for FallbackResult {
    fn from(value: Value) -> Self {
        FallbackResult::commit(value)
    }
}

/// The tagged outcome of a `fetch` or `get_and_update`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Fetched {
    /// This caller's fallback committed the value
    Commit(Value),
    /// The value was already present, or was committed by another caller
    Ok(Value),
    /// The fallback chose not to store the value
    Ignore(Value),
}

impl Fetched {
    /// The carried value, whatever the tag.
    pub fn value(&self) -> &Value {
        match self {
            Fetched::Commit(value) | Fetched::Ok(value) | Fetched::Ignore(value) => value,
        }
    }

    /// Unwrap into the carried value.
    pub fn into_value(self) -> Value {
        match self {
            Fetched::Commit(value) | Fetched::Ok(value) | Fetched::Ignore(value) => value,
        }
    }
}

/// Work handed to the executor on a miss: the fallback computation plus
/// the write used to persist a committed value.
pub(crate) struct FlightJob {
    /// The fallback itself, already adapted to a concrete future
    pub(crate) work: BoxFuture<'static, anyhow::Result<FallbackResult>>,
    /// Writes a committed value through the cache's write path without
    /// emitting hook notifications
    pub(crate) commit: Box<dyn FnOnce(Value, Option<u64>) -> BoxFuture<'static, ()> + Send>,
}

enum FlightMsg {
    Dispatch {
        key: Key,
        job: FlightJob,
        reply: oneshot::Sender<Result<Fetched>>,
    },
    Complete {
        key: Key,
        result: Result<Fetched>,
    },
}

/// Handle to a cache's single-flight executor task.
#[derive(Clone, Debug)]
pub(crate) struct SingleFlight {
    messages: mpsc::UnboundedSender<FlightMsg>,
    abort: AbortHandle,
}

impl SingleFlight {
    /// Spawn the executor task.
    pub(crate) fn start() -> Self {
        let (messages, inbox) = mpsc::unbounded_channel();
        let (abort, abort_reg) = AbortHandle::new_pair();
        let completions = messages.clone();
        tokio::spawn(Abortable::new(run(inbox, completions), abort_reg));
        SingleFlight { messages, abort }
    }

    /// Abort the executor. Pending callers observe `NotStarted`.
    pub(crate) fn stop(&self) {
        self.abort.abort();
    }

    /// Queue the caller on the in-flight computation for `key`, spawning
    /// one when none is running, and await the shared outcome.
    pub(crate) async fn dispatch(&self, key: Key, job: FlightJob) -> Result<Fetched> {
        let (reply, on_reply) = oneshot::channel();
        self.messages
            .send(FlightMsg::Dispatch { key, job, reply })
            .map_err(|_| Error::NotStarted)?;
        on_reply.await.map_err(|_| Error::NotStarted)?
    }
}

async fn run(
    mut inbox: mpsc::UnboundedReceiver<FlightMsg>,
    completions: mpsc::UnboundedSender<FlightMsg>,
) {
    let mut waiters: HashMap<Key, Vec<oneshot::Sender<Result<Fetched>>>> = HashMap::new();
    while let Some(message) = inbox.recv().await {
        match message {
            FlightMsg::Dispatch { key, job, reply } => match waiters.entry(key.clone()) {
                MapEntry::Occupied(mut in_flight) => {
                    trace!(key = %key, "fetch coalesced onto in-flight fallback");
                    in_flight.get_mut().push(reply);
                }
                MapEntry::Vacant(slot) => {
                    slot.insert(vec![reply]);
                    let completions = completions.clone();
                    tokio::spawn(async move {
                        let result = execute(job).await;
                        // the executor going away means nobody is waiting
                        let _ = completions.send(FlightMsg::Complete { key, result });
                    });
                }
            },
            FlightMsg::Complete { key, result } => {
                // drop the entry before replying so a new fetch for this
                // key starts a fresh computation
                let Some(queued) = waiters.remove(&key) else {
                    continue;
                };
                let mut first = true;
                for waiter in queued {
                    let outcome = if first {
                        result.clone()
                    } else {
                        demote(result.clone())
                    };
                    first = false;
                    // callers that went away just drop their reply
                    let _ = waiter.send(outcome);
                }
            }
        }
    }
}

/// Rewrite commit to ok for every waiter after the first.
fn demote(result: Result<Fetched>) -> Result<Fetched> {
    match result {
        Ok(Fetched::Commit(value)) => Ok(Fetched::Ok(value)),
        other => other,
    }
}

/// Run one fallback to completion, persisting a committed value, and
/// normalize every failure mode into an error the waiters can share.
async fn execute(job: FlightJob) -> Result<Fetched> {
    let FlightJob { work, commit } = job;
    match std::panic::AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(FallbackResult::Commit { value, expire })) => {
            commit(value.clone(), expire).await;
            Ok(Fetched::Commit(value))
        }
        Ok(Ok(FallbackResult::Ignore(value))) => Ok(Fetched::Ignore(value)),
        Ok(Err(error)) => Err(Error::Fallback {
            message: format!("{error:#}"),
            trace: Backtrace::force_capture().to_string(),
        }),
        Err(panic) => Err(Error::Fallback {
            message: panic_message(panic),
            trace: Backtrace::force_capture().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn job_with(
        runs: Arc<AtomicUsize>,
        commits: Arc<AtomicUsize>,
        result: FallbackResult,
        delay: Duration,
    ) -> FlightJob {
        FlightJob {
            work: Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(result)
            }),
            commit: Box::new(move |_, _| {
                Box::pin(async move {
                    commits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_execution() {
        let flight = SingleFlight::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let commits = Arc::new(AtomicUsize::new(0));
        let key = Key::from("shared");

        let mut calls = Vec::new();
        for _ in 0..8 {
            let job = job_with(
                Arc::clone(&runs),
                Arc::clone(&commits),
                FallbackResult::commit(Value::from("v")),
                Duration::from_millis(20),
            );
            calls.push(flight.dispatch(key.clone(), job));
        }
        let outcomes = futures::future::join_all(calls).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Fetched::Commit(_))))
            .count();
        let okayed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Fetched::Ok(_))))
            .count();
        assert_eq!(committed, 1, "exactly one caller observes the commit");
        assert_eq!(okayed, 7);
        for outcome in outcomes {
            assert_eq!(outcome.expect("fetch should succeed").into_value(), "v");
        }
    }

    #[tokio::test]
    async fn completion_clears_the_key_for_fresh_fetches() {
        let flight = SingleFlight::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let commits = Arc::new(AtomicUsize::new(0));
        let key = Key::from("fresh");

        for _ in 0..2 {
            let job = job_with(
                Arc::clone(&runs),
                Arc::clone(&commits),
                FallbackResult::commit(Value::from(1)),
                Duration::ZERO,
            );
            flight
                .dispatch(key.clone(), job)
                .await
                .expect("fetch should succeed");
        }
        // sequential fetches each run their own fallback
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ignored_results_are_not_committed() {
        let flight = SingleFlight::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let commits = Arc::new(AtomicUsize::new(0));
        let job = job_with(
            Arc::clone(&runs),
            Arc::clone(&commits),
            FallbackResult::ignore(Value::from("skip")),
            Duration::ZERO,
        );
        let outcome = flight
            .dispatch(Key::from("ignored"), job)
            .await
            .expect("fetch should succeed");
        assert_eq!(outcome, Fetched::Ignore(Value::from("skip")));
        assert_eq!(commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_fallbacks_error_every_waiter() {
        let flight = SingleFlight::start();
        let key = Key::from("blown");
        let panicking = FlightJob {
            work: Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                panic!("fallback blew up");
            }),
            commit: Box::new(|_, _| Box::pin(async {})),
        };
        let idle = FlightJob {
            work: Box::pin(async { Ok(FallbackResult::commit(Value::Null)) }),
            commit: Box::new(|_, _| Box::pin(async {})),
        };
        let (a, b) = tokio::join!(
            flight.dispatch(key.clone(), panicking),
            flight.dispatch(key.clone(), idle)
        );
        for outcome in [a, b] {
            match outcome {
                Err(Error::Fallback { message, trace }) => {
                    assert_eq!(message, "fallback blew up");
                    assert!(!trace.is_empty());
                }
                other => panic!("expected a fallback error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn departed_callers_do_not_stop_the_commit() {
        let flight = SingleFlight::start();
        let runs = Arc::new(AtomicUsize::new(0));
        let commits = Arc::new(AtomicUsize::new(0));
        let job = job_with(
            Arc::clone(&runs),
            Arc::clone(&commits),
            FallbackResult::commit(Value::from("kept")),
            Duration::from_millis(20),
        );
        let call = flight.dispatch(Key::from("departed"), job);
        // caller gives up immediately
        drop(tokio::time::timeout(Duration::from_millis(1), call).await);
        // the worker still completes and commits
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }
}
