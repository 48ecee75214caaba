//! Hook registration and notification fan-out.
//!
//! A hook subscribes to cache actions either before they execute (pre) or
//! after they complete (post). Hooks are notified sequentially in
//! declaration order; asynchronous hooks receive notifications through a
//! dedicated mailbox task and never block the acting caller, synchronous
//! hooks are awaited inline with an optional per-hook timeout. Spawning a
//! task per notification is deliberately avoided.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{AbortHandle, Abortable};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::value::Value;

/// Well-known action names, usable in [`ActionFilter::Only`] lists.
pub mod actions {
    /// `clear` action
    pub const CLEAR: &str = "clear";
    /// `decr` action
    pub const DECR: &str = "decr";
    /// `del` action
    pub const DEL: &str = "del";
    /// `execute` action
    pub const EXECUTE: &str = "execute";
    /// `exists` action
    pub const EXISTS: &str = "exists";
    /// `expire` action
    pub const EXPIRE: &str = "expire";
    /// `fetch` action
    pub const FETCH: &str = "fetch";
    /// `get` action
    pub const GET: &str = "get";
    /// `get_and_update` action
    pub const GET_AND_UPDATE: &str = "get_and_update";
    /// `incr` action
    pub const INCR: &str = "incr";
    /// `invoke` action
    pub const INVOKE: &str = "invoke";
    /// `keys` action
    pub const KEYS: &str = "keys";
    /// `purge` action, also broadcast by the sweeper and lazy expiry
    pub const PURGE: &str = "purge";
    /// `put` action
    pub const PUT: &str = "put";
    /// `put_many` action
    pub const PUT_MANY: &str = "put_many";
    /// `refresh` action
    pub const REFRESH: &str = "refresh";
    /// `size` action
    pub const SIZE: &str = "size";
    /// `stream` action
    pub const STREAM: &str = "stream";
    /// `take` action
    pub const TAKE: &str = "take";
    /// `touch` action
    pub const TOUCH: &str = "touch";
    /// `ttl` action
    pub const TTL: &str = "ttl";
    /// `transaction` action
    pub const TRANSACTION: &str = "transaction";
    /// `update` action
    pub const UPDATE: &str = "update";
    /// `warm` action
    pub const WARM: &str = "warm";
}

/// Whether a hook fires before or after the action it observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// Delivered before the action executes; sees no result
    Pre,
    /// Delivered after the action completes; sees the result
    Post,
}

/// Which actions a hook wants to observe.
#[derive(Clone, Debug, Default)]
pub enum ActionFilter {
    /// Every action
    #[default]
    All,
    /// Only the named actions
    Only(Vec<&'static str>),
}

impl ActionFilter {
    /// Whether `action` passes this filter.
    pub fn allows(&self, action: &str) -> bool {
        match self {
            ActionFilter::All => true,
            ActionFilter::Only(names) => names.contains(&action),
        }
    }
}

/// Runtime values a hook can ask to be supplied with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionKind {
    /// The cache handle; re-delivered whenever the cache record changes
    Cache,
}

/// A provisioned runtime value. Hooks must tolerate receiving the same
/// provision kind multiple times over their lifetime.
#[derive(Clone, Debug)]
pub enum Provision {
    /// A handle to the cache the hook is attached to
    Cache(crate::cache::Cache),
}

/// A named action with its (JSON-rendered) arguments.
#[derive(Clone, Debug)]
pub struct Action {
    /// The action name, one of [`actions`]
    pub name: &'static str,
    /// The action arguments in call order
    pub args: Vec<Value>,
}

impl Action {
    /// Build an action payload.
    pub fn new(name: &'static str, args: Vec<Value>) -> Self {
        Action { name, args }
    }
}

/// What a hook receives: the action, and for post hooks the result.
#[derive(Clone, Debug)]
pub struct Notification {
    /// The action being (or having been) executed
    pub action: Action,
    /// `None` for pre hooks; the JSON-rendered result for post hooks
    pub result: Option<Value>,
}

/// An observer of cache actions.
///
/// Implementations declare their capabilities through the provider
/// methods; only [`Hook::handle_notify`] is mandatory.
#[async_trait::async_trait]
pub trait Hook: Send + Sync + 'static {
    /// A stable name for this hook, used in logs and whitelists.
    fn name(&self) -> &str;

    /// Whether this hook fires before or after actions.
    fn kind(&self) -> HookKind;

    /// Asynchronous hooks are notified through a mailbox and never block
    /// the caller. Synchronous hooks suspend the action until they return.
    fn is_async(&self) -> bool {
        true
    }

    /// Upper bound on a synchronous notification. On expiry the result is
    /// dropped and dispatch moves to the next hook; no error is raised.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Which actions this hook observes.
    fn actions(&self) -> ActionFilter {
        ActionFilter::All
    }

    /// Which runtime values this hook wants provisioned.
    fn provisions(&self) -> Vec<ProvisionKind> {
        Vec::new()
    }

    /// Receive a notification. Errors are logged and otherwise ignored.
    async fn handle_notify(&self, notification: &Notification) -> anyhow::Result<()>;

    /// Receive a provisioned value. The default implementation drops it.
    async fn handle_provision(&self, provision: Provision) -> anyhow::Result<()> {
        let _ = provision;
        Ok(())
    }
}

enum HookMessage {
    Notify(Arc<Notification>),
    Provision(Provision),
}

/// A hook bound to its running mailbox (for async hooks).
struct StartedHook {
    hook: Arc<dyn Hook>,
    mailbox: Option<mpsc::UnboundedSender<HookMessage>>,
    abort: Option<AbortHandle>,
}

impl StartedHook {
    fn start(hook: Arc<dyn Hook>) -> Self {
        if !hook.is_async() {
            return StartedHook {
                hook,
                mailbox: None,
                abort: None,
            };
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (abort, abort_reg) = AbortHandle::new_pair();
        let consumer = Arc::clone(&hook);
        tokio::spawn(Abortable::new(
            async move {
                while let Some(message) = rx.recv().await {
                    let result = match message {
                        HookMessage::Notify(notification) => {
                            consumer.handle_notify(&notification).await
                        }
                        HookMessage::Provision(provision) => {
                            consumer.handle_provision(provision).await
                        }
                    };
                    if let Err(e) = result {
                        warn!(hook = consumer.name(), error = %e, "hook notification failed");
                    }
                }
            },
            abort_reg,
        ));
        StartedHook {
            hook,
            mailbox: Some(tx),
            abort: Some(abort),
        }
    }

    async fn notify(&self, notification: &Arc<Notification>) {
        match &self.mailbox {
            Some(mailbox) => {
                // A closed mailbox means the hook task is gone; skip it.
                if mailbox
                    .send(HookMessage::Notify(Arc::clone(notification)))
                    .is_err()
                {
                    debug!(hook = self.hook.name(), "hook is not running, skipped");
                }
            }
            None => match self.hook.timeout() {
                Some(limit) => {
                    if tokio::time::timeout(limit, self.hook.handle_notify(notification))
                        .await
                        .is_err()
                    {
                        trace!(hook = self.hook.name(), "hook timed out, result dropped");
                    }
                }
                None => {
                    if let Err(e) = self.hook.handle_notify(notification).await {
                        warn!(hook = self.hook.name(), error = %e, "hook notification failed");
                    }
                }
            },
        }
    }

    async fn provide(&self, provision: Provision) {
        match &self.mailbox {
            Some(mailbox) => {
                let _ = mailbox.send(HookMessage::Provision(provision));
            }
            None => {
                if let Err(e) = self.hook.handle_provision(provision).await {
                    warn!(hook = self.hook.name(), error = %e, "hook provisioning failed");
                }
            }
        }
    }
}

/// The per-cache hook dispatch table: two ordered lists, pre and post.
#[derive(Clone, Default)]
pub(crate) struct HookRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    pre: Vec<StartedHook>,
    post: Vec<StartedHook>,
}

impl fmt::Debug for HookRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRouter")
            .field("pre", &self.inner.pre.len())
            .field("post", &self.inner.post.len())
            .finish()
    }
}

impl HookRouter {
    /// Start every hook and build the dispatch table, preserving the
    /// declaration order within each list.
    pub(crate) fn start(hooks: &[Arc<dyn Hook>]) -> Self {
        let mut pre = Vec::new();
        let mut post = Vec::new();
        for hook in hooks {
            let started = StartedHook::start(Arc::clone(hook));
            match hook.kind() {
                HookKind::Pre => pre.push(started),
                HookKind::Post => post.push(started),
            }
        }
        HookRouter {
            inner: Arc::new(RouterInner { pre, post }),
        }
    }

    /// Notify pre hooks that `action` is about to execute.
    pub(crate) async fn notify_pre(&self, action: Action) {
        let notification = Arc::new(Notification {
            action,
            result: None,
        });
        for started in &self.inner.pre {
            if started.hook.actions().allows(notification.action.name) {
                started.notify(&notification).await;
            }
        }
    }

    /// Notify post hooks that `action` completed with `result`.
    pub(crate) async fn notify_post(&self, action: Action, result: Value) {
        let notification = Arc::new(Notification {
            action,
            result: Some(result),
        });
        for started in &self.inner.post {
            if started.hook.actions().allows(notification.action.name) {
                started.notify(&notification).await;
            }
        }
    }

    /// Deliver `provision` to every hook that declared interest in its
    /// kind, in declaration order (pre list first).
    pub(crate) async fn provision(&self, kind: ProvisionKind, provision: Provision) {
        for started in self.inner.pre.iter().chain(self.inner.post.iter()) {
            if started.hook.provisions().contains(&kind) {
                started.provide(provision.clone()).await;
            }
        }
    }

    /// Abort every mailbox task.
    pub(crate) fn stop(&self) {
        for started in self.inner.pre.iter().chain(self.inner.post.iter()) {
            if let Some(abort) = &started.abort {
                abort.abort();
            }
        }
    }
}
