#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachet::{
    ActionFilter, Cache, CacheConfig, Hook, HookKind, Notification, Provision, ProvisionKind,
    Value,
};

static NAMES: AtomicUsize = AtomicUsize::new(0);

/// A process-unique cache name; the registry is global, so every test
/// works against its own cache.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", NAMES.fetch_add(1, Ordering::SeqCst))
}

/// Start a plain cache with defaults for tests that only need a name.
pub async fn start_plain(prefix: &str) -> Cache {
    Cache::start(CacheConfig::builder(unique_name(prefix)).build())
        .await
        .expect("cache should start")
}

/// A synchronous hook that records everything it observes. Synchronous
/// delivery keeps assertions deterministic: once an operation returns,
/// its notifications have landed.
pub struct RecordingHook {
    name: &'static str,
    kind: HookKind,
    filter: ActionFilter,
    wants_cache: bool,
    seen: Mutex<Vec<(String, Option<Value>)>>,
    provisions: Mutex<Vec<String>>,
}

impl RecordingHook {
    pub fn pre(name: &'static str) -> Arc<Self> {
        Arc::new(RecordingHook {
            name,
            kind: HookKind::Pre,
            filter: ActionFilter::All,
            wants_cache: false,
            seen: Mutex::new(Vec::new()),
            provisions: Mutex::new(Vec::new()),
        })
    }

    pub fn post(name: &'static str) -> Arc<Self> {
        Arc::new(RecordingHook {
            name,
            kind: HookKind::Post,
            filter: ActionFilter::All,
            wants_cache: false,
            seen: Mutex::new(Vec::new()),
            provisions: Mutex::new(Vec::new()),
        })
    }

    pub fn post_filtered(name: &'static str, only: Vec<&'static str>) -> Arc<Self> {
        Arc::new(RecordingHook {
            name,
            kind: HookKind::Post,
            filter: ActionFilter::Only(only),
            wants_cache: false,
            seen: Mutex::new(Vec::new()),
            provisions: Mutex::new(Vec::new()),
        })
    }

    pub fn provisioned(name: &'static str) -> Arc<Self> {
        Arc::new(RecordingHook {
            name,
            kind: HookKind::Post,
            filter: ActionFilter::All,
            wants_cache: true,
            seen: Mutex::new(Vec::new()),
            provisions: Mutex::new(Vec::new()),
        })
    }

    /// Everything observed so far as `(action, result)` pairs.
    pub fn observed(&self) -> Vec<(String, Option<Value>)> {
        self.seen.lock().expect("seen lock poisoned").clone()
    }

    /// Observed occurrences of one action.
    pub fn observed_action(&self, action: &str) -> Vec<Option<Value>> {
        self.observed()
            .into_iter()
            .filter(|(name, _)| name == action)
            .map(|(_, result)| result)
            .collect()
    }

    /// Names of caches provisioned to this hook.
    pub fn provisioned_caches(&self) -> Vec<String> {
        self.provisions.lock().expect("provision lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Hook for RecordingHook {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> HookKind {
        self.kind
    }

    fn is_async(&self) -> bool {
        false
    }

    fn actions(&self) -> ActionFilter {
        self.filter.clone()
    }

    fn provisions(&self) -> Vec<ProvisionKind> {
        if self.wants_cache {
            vec![ProvisionKind::Cache]
        } else {
            Vec::new()
        }
    }

    async fn handle_notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.seen
            .lock()
            .expect("seen lock poisoned")
            .push((notification.action.name.to_string(), notification.result.clone()));
        Ok(())
    }

    async fn handle_provision(&self, provision: Provision) -> anyhow::Result<()> {
        let Provision::Cache(cache) = provision;
        self.provisions
            .lock()
            .expect("provision lock poisoned")
            .push(cache.name().to_string());
        Ok(())
    }
}

/// Poll until `check` passes or the deadline elapses.
pub async fn eventually<F>(deadline: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    loop {
        if check() {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
