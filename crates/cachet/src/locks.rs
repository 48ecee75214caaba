//! Row-level locking and the per-cache transaction queue.
//!
//! The lock table is a single process-global map keyed by
//! `(cache name, key)`, shared across every cache in the process. Each
//! cache owns one serial queue task; transactions are dispatched to that
//! queue, which acquires the row locks, runs the body with failures
//! captured, and releases the locks on every path. Writes to keys that are
//! currently locked by somebody else are pushed through the same queue, so
//! they drain strictly after the transaction holding the lock.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{AbortHandle, Abortable};
use futures::FutureExt;
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::Key;

type LockRow = (Arc<str>, Key);

/// The process-global row-lock table.
static LOCK_TABLE: Lazy<DashMap<LockRow, Uuid>> = Lazy::new(DashMap::new);

tokio::task_local! {
    /// Identity of the transaction the current task is executing, if any.
    static CURRENT_HOLDER: Uuid;
}

/// The transaction identity of the calling task.
pub(crate) fn current_holder() -> Option<Uuid> {
    CURRENT_HOLDER.try_with(|id| *id).ok()
}

/// Whether the calling task is already inside a transaction.
pub(crate) fn in_transaction() -> bool {
    current_holder().is_some()
}

/// Insert `(cache, key) -> owner` rows for every key, all or nothing.
///
/// Only the owning cache's serial queue inserts rows for that cache, so
/// the check-then-insert below cannot race with another inserter of the
/// same rows.
pub(crate) fn lock(cache: &Arc<str>, keys: &[Key], owner: Uuid) -> bool {
    let contested = keys.iter().any(|key| {
        LOCK_TABLE
            .get(&(Arc::clone(cache), key.clone()))
            .is_some_and(|row| *row != owner)
    });
    if contested {
        return false;
    }
    for key in keys {
        LOCK_TABLE.insert((Arc::clone(cache), key.clone()), owner);
    }
    true
}

/// Remove every row over `keys` owned by `owner`.
pub(crate) fn unlock(cache: &Arc<str>, keys: &[Key], owner: Uuid) {
    for key in keys {
        LOCK_TABLE.remove_if(&(Arc::clone(cache), key.clone()), |_, holder| *holder == owner);
    }
}

/// Whether any of `keys` is locked by someone other than the caller.
pub(crate) fn is_locked_by_other(cache: &Arc<str>, keys: &[Key]) -> bool {
    let caller = current_holder();
    keys.iter().any(|key| {
        LOCK_TABLE
            .get(&(Arc::clone(cache), key.clone()))
            .is_some_and(|row| Some(*row) != caller)
    })
}

/// Render a panic payload into a message we can carry in an error.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "closure panicked".to_string()
    }
}

type QueueJob = BoxFuture<'static, ()>;

/// The serial write/transaction queue owned by a single cache.
///
/// The consumer task runs one job to completion before taking the next,
/// which is the whole ordering story: a queued write cannot overtake the
/// transaction whose locks delayed it.
#[derive(Clone, Debug)]
pub(crate) struct TransactionQueue {
    jobs: mpsc::UnboundedSender<QueueJob>,
    abort: AbortHandle,
}

impl TransactionQueue {
    /// Spawn the queue consumer.
    pub(crate) fn start() -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<QueueJob>();
        let (abort, abort_reg) = AbortHandle::new_pair();
        tokio::spawn(Abortable::new(
            async move {
                while let Some(job) = queue.recv().await {
                    job.await;
                }
            },
            abort_reg,
        ));
        TransactionQueue { jobs, abort }
    }

    /// Abort the consumer task. Queued jobs are dropped; their callers
    /// observe a closed reply channel.
    pub(crate) fn stop(&self) {
        self.abort.abort();
    }

    /// Run `body` as a transaction over `keys`.
    ///
    /// Re-entrant calls (a transaction body opening another transaction)
    /// run the body directly on the caller's task. Otherwise the body is
    /// dispatched to the serial queue, which locks the rows, runs the body
    /// with panics captured, and unlocks on every path.
    pub(crate) async fn transaction<F, Fut, T>(
        &self,
        cache: Arc<str>,
        keys: Vec<Key>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if in_transaction() {
            return body().await;
        }
        let (reply, on_reply) = oneshot::channel();
        let job = async move {
            let owner = Uuid::new_v4();
            if !lock(&cache, &keys, owner) {
                // every row for this cache is managed by this queue, so a
                // contested lock here means another cache shares our name
                warn!(cache = %cache, "transaction keys unexpectedly contested");
            }
            let outcome = std::panic::AssertUnwindSafe(CURRENT_HOLDER.scope(owner, body()))
                .catch_unwind()
                .await;
            unlock(&cache, &keys, owner);
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(Error::Transaction(panic_message(panic))),
            };
            let _ = reply.send(result);
        }
        .boxed();
        self.jobs.send(job).map_err(|_| Error::NotStarted)?;
        on_reply.await.map_err(|_| Error::NotStarted)?
    }

    /// Run a write over `keys`.
    ///
    /// The write runs directly on the caller's task when the transaction
    /// machinery is off, when the caller IS the transaction, or when no
    /// key is locked by somebody else. Otherwise it is queued, with no
    /// locks of its own, behind whatever the queue is currently running.
    pub(crate) async fn write<F, T>(
        &self,
        cache: &Arc<str>,
        keys: &[Key],
        enabled: bool,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !enabled || in_transaction() || !is_locked_by_other(cache, keys) {
            return op();
        }
        trace!(cache = %cache, "write delayed behind held locks");
        let (reply, on_reply) = oneshot::channel();
        let job = async move {
            let _ = reply.send(op());
        }
        .boxed();
        self.jobs.send(job).map_err(|_| Error::NotStarted)?;
        on_reply.await.map_err(|_| Error::NotStarted)?
    }
}
