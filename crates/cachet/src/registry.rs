//! The process-global registry of running caches.
//!
//! One registry per process maps cache names to their records. Updates are
//! serialized by a single-writer lock, and every successful update
//! re-provisions the hooks that asked to be kept supplied with the cache
//! record.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::cache::{Cache, CacheRecord};
use crate::error::{Error, Result};
use crate::hooks::{Provision, ProvisionKind};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

#[derive(Default)]
struct Registry {
    caches: RwLock<HashMap<String, Arc<CacheRecord>>>,
    /// one pending update at a time, process-wide
    update_lock: Mutex<()>,
}

/// Register a freshly started cache. Fails when the name is taken.
pub(crate) async fn register(record: Arc<CacheRecord>) -> Result<()> {
    let mut caches = REGISTRY.caches.write().await;
    let name = record.name.to_string();
    if caches.contains_key(&name) {
        return Err(Error::AlreadyStarted);
    }
    debug!(cache = %name, "cache registered");
    caches.insert(name, record);
    Ok(())
}

/// Remove a cache from the registry, returning its record.
pub(crate) async fn unregister(name: &str) -> Option<Arc<CacheRecord>> {
    let removed = REGISTRY.caches.write().await.remove(name);
    if removed.is_some() {
        debug!(cache = %name, "cache unregistered");
    }
    removed
}

/// Look up a cache record by name.
pub(crate) async fn retrieve(name: &str) -> Option<Arc<CacheRecord>> {
    REGISTRY.caches.read().await.get(name).cloned()
}

/// Whether a cache is registered under `name`.
pub(crate) async fn is_known(name: &str) -> bool {
    REGISTRY.caches.read().await.contains_key(name)
}

/// Apply `mutate` to the record registered under `name`, swap the result
/// in, and re-provision interested hooks with the updated cache.
///
/// Updates are serialized: a second caller waits until the first has both
/// swapped and provisioned. Returns the new record.
pub(crate) async fn update<F>(name: &str, mutate: F) -> Result<Arc<CacheRecord>>
where
    F: FnOnce(&CacheRecord) -> CacheRecord,
{
    let _serialized = REGISTRY.update_lock.lock().await;
    let updated = {
        let mut caches = REGISTRY.caches.write().await;
        let current = caches.get(name).ok_or(Error::NoCache)?;
        let updated = Arc::new(mutate(current));
        caches.insert(name.to_string(), Arc::clone(&updated));
        updated
    };
    let handle = Cache::from_name(Arc::clone(&updated.name));
    updated
        .hooks
        .provision(ProvisionKind::Cache, Provision::Cache(handle))
        .await;
    Ok(updated)
}
