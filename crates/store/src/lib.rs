//! Rekon resource cache: an indexed, eventually-consistent mirror of a
//! [`ResourceStore`], kept current by a list + watch loop.
//!
//! Observers are notified synchronously, in feed order, after the index has
//! been updated and its lock released.

#![forbid(unsafe_code)]

mod memory;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::{counter, gauge};
use rekon_core::{Backoff, ChangeKind, Key, Resource, ResourceStore, StoreError, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use memory::MemoryStore;

/// Index installed on every cache: resources by namespace.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Floor for the pause before a relist.
const MIN_RELIST_PAUSE: Duration = Duration::from_millis(1);

/// Computes the index values of a resource.
pub type IndexFn = Arc<dyn Fn(&Resource) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("index already registered: {0}")]
    IndexExists(String),
}

/// A removed resource. `Tombstone` is used when the deletion was not observed
/// on the watch feed but inferred from a relist; it carries the last state
/// the cache knew about.
#[derive(Debug, Clone)]
pub enum DeletedResource {
    Final(Arc<Resource>),
    Tombstone { key: Key, last_known: Arc<Resource> },
}

impl DeletedResource {
    pub fn key(&self) -> Key {
        match self {
            DeletedResource::Final(r) => r.key(),
            DeletedResource::Tombstone { key, .. } => key.clone(),
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        match self {
            DeletedResource::Final(r) => r,
            DeletedResource::Tombstone { last_known, .. } => last_known,
        }
    }
}

/// Receives cache transitions.
pub trait ResourceObserver: Send + Sync {
    fn on_added(&self, resource: &Arc<Resource>);
    fn on_updated(&self, old: &Arc<Resource>, new: &Arc<Resource>);
    fn on_deleted(&self, deleted: &DeletedResource);
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Re-announce every cached resource as updated on this period.
    pub resync_period: Option<Duration>,
    pub watch_backoff_initial: Duration,
    pub watch_backoff_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_period: None,
            watch_backoff_initial: Duration::from_millis(800),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

enum Notification {
    Added(Arc<Resource>),
    Updated(Arc<Resource>, Arc<Resource>),
    Deleted(DeletedResource),
}

struct Index {
    items: FxHashMap<Key, Arc<Resource>>,
    indexers: FxHashMap<String, IndexFn>,
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<Key>>>,
    resource_version: String,
}

impl Index {
    fn new() -> Self {
        let mut indexers: FxHashMap<String, IndexFn> = FxHashMap::default();
        indexers.insert(NAMESPACE_INDEX.to_string(), Arc::new(|r: &Resource| vec![r.namespace.clone()]));
        Self { items: FxHashMap::default(), indexers, indices: FxHashMap::default(), resource_version: String::new() }
    }

    fn upsert(&mut self, res: Arc<Resource>) -> Option<Arc<Resource>> {
        let key = res.key();
        let old = self.items.insert(key.clone(), Arc::clone(&res));
        if let Some(o) = &old {
            self.unindex(&key, o);
        }
        self.index(&key, &res);
        old
    }

    fn remove(&mut self, key: &Key) -> Option<Arc<Resource>> {
        let old = self.items.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn index(&mut self, key: &Key, res: &Resource) {
        for (name, f) in self.indexers.iter() {
            let by_value = self.indices.entry(name.clone()).or_default();
            for v in f(res) {
                by_value.entry(v).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &Key, res: &Resource) {
        for (name, f) in self.indexers.iter() {
            let Some(by_value) = self.indices.get_mut(name) else { continue };
            for v in f(res) {
                if let Some(keys) = by_value.get_mut(&v) {
                    keys.remove(key);
                    if keys.is_empty() {
                        by_value.remove(&v);
                    }
                }
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ResourceCache {
    store: Arc<dyn ResourceStore>,
    config: CacheConfig,
    index: Mutex<Index>,
    observers: ArcSwap<Vec<Arc<dyn ResourceObserver>>>,
    synced: watch::Sender<bool>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn ResourceStore>, config: CacheConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self { store, config, index: Mutex::new(Index::new()), observers: ArcSwap::from_pointee(Vec::new()), synced }
    }

    pub fn add_observer(&self, observer: Arc<dyn ResourceObserver>) {
        self.observers.rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(Arc::clone(&observer));
            next
        });
    }

    /// Register a secondary index; existing entries are indexed immediately.
    pub fn add_indexer(&self, name: &str, f: IndexFn) -> Result<(), CacheError> {
        let mut idx = lock(&self.index);
        if idx.indexers.contains_key(name) {
            return Err(CacheError::IndexExists(name.to_string()));
        }
        let mut by_value: FxHashMap<String, FxHashSet<Key>> = FxHashMap::default();
        for (key, res) in idx.items.iter() {
            for v in f(res) {
                by_value.entry(v).or_default().insert(key.clone());
            }
        }
        idx.indices.insert(name.to_string(), by_value);
        idx.indexers.insert(name.to_string(), f);
        Ok(())
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolve once the first full list has been applied.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    pub fn get_by_key(&self, key: &Key) -> Option<Arc<Resource>> {
        lock(&self.index).items.get(key).cloned()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<Resource>>, CacheError> {
        let idx = lock(&self.index);
        if !idx.indexers.contains_key(index) {
            return Err(CacheError::UnknownIndex(index.to_string()));
        }
        let mut out: Vec<Arc<Resource>> = idx
            .indices
            .get(index)
            .and_then(|by_value| by_value.get(value))
            .map(|keys| keys.iter().filter_map(|k| idx.items.get(k).cloned()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.namespace.cmp(&b.namespace)));
        Ok(out)
    }

    pub fn list_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = lock(&self.index).items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize { lock(&self.index).items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Last version token applied from the store.
    pub fn resource_version(&self) -> String {
        lock(&self.index).resource_version.clone()
    }

    /// List, then follow the watch feed; relist whenever the feed breaks.
    /// Returns only when `cancel` fires.
    ///
    /// Every relist is preceded by a backoff pause. The pause grows while
    /// watches keep breaking and resets once a watch delivers an event or
    /// stays open for `watch_backoff_max`.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("cache sync started");
        let initial = self.config.watch_backoff_initial.max(MIN_RELIST_PAUSE);
        let mut backoff = Backoff::new(initial, self.config.watch_backoff_max.max(initial));
        let mut resync = self.config.resync_period.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        'relist: loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.store.list() => r,
            };
            let list = match listed {
                Ok(list) => list,
                Err(e) => {
                    counter!("cache_store_errors_total", 1u64, "op" => "list");
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "list failed; backing off");
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };
            let count = list.items.len();
            self.replace(list.items, list.resource_version);
            if !self.has_synced() {
                self.synced.send_replace(true);
                info!(items = count, "cache synced");
            } else {
                debug!(items = count, "relist applied");
            }

            let since = self.resource_version();
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.store.watch(&since) => r,
            };
            match opened {
                Ok(mut stream) => {
                    let opened_at = Instant::now();
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'relist,
                            _ = next_tick(&mut resync) => self.resync(),
                            ev = stream.next() => match ev {
                                Some(Ok(ev)) => {
                                    backoff.reset();
                                    self.apply(ev);
                                }
                                Some(Err(StoreError::Expired(reason))) => {
                                    info!(%reason, "watch expired");
                                    break;
                                }
                                Some(Err(e)) => {
                                    counter!("cache_store_errors_total", 1u64, "op" => "watch");
                                    warn!(error = %e, "watch broke");
                                    break;
                                }
                                None => {
                                    debug!("watch stream ended");
                                    break;
                                }
                            },
                        }
                    }
                    if opened_at.elapsed() >= self.config.watch_backoff_max {
                        backoff.reset();
                    }
                }
                Err(StoreError::Expired(reason)) => info!(%reason, "watch cursor expired"),
                Err(e) => {
                    counter!("cache_store_errors_total", 1u64, "op" => "watch");
                    warn!(error = %e, "watch failed to open");
                }
            }
            counter!("cache_relists_total", 1u64);
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "relisting after pause");
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }
        info!("cache sync stopped");
    }

    fn apply(&self, ev: WatchEvent) {
        counter!("cache_events_total", 1u64, "kind" => ev.kind.as_str());
        let res = Arc::new(ev.resource);
        let (note, items) = {
            let mut idx = lock(&self.index);
            if !res.resource_version.is_empty() {
                idx.resource_version = res.resource_version.clone();
            }
            let note = match ev.kind {
                ChangeKind::Added | ChangeKind::Updated => match idx.upsert(Arc::clone(&res)) {
                    Some(old) => Notification::Updated(old, res),
                    None => Notification::Added(res),
                },
                ChangeKind::Deleted => {
                    idx.remove(&res.key());
                    Notification::Deleted(DeletedResource::Final(res))
                }
            };
            (note, idx.items.len())
        };
        gauge!("cache_items", items as f64);
        self.notify(&note);
    }

    /// Swap in a full listing. Keys that vanished become tombstones.
    fn replace(&self, items: Vec<Resource>, resource_version: String) {
        let (notes, len) = {
            let mut idx = lock(&self.index);
            let mut fresh: FxHashSet<Key> = FxHashSet::default();
            let mut notes = Vec::with_capacity(items.len());
            for r in items {
                let r = Arc::new(r);
                fresh.insert(r.key());
                notes.push(match idx.upsert(Arc::clone(&r)) {
                    Some(old) => Notification::Updated(old, r),
                    None => Notification::Added(r),
                });
            }
            let stale: Vec<Key> = idx.items.keys().filter(|k| !fresh.contains(*k)).cloned().collect();
            for key in stale {
                if let Some(last_known) = idx.remove(&key) {
                    notes.push(Notification::Deleted(DeletedResource::Tombstone { key, last_known }));
                }
            }
            idx.resource_version = resource_version;
            (notes, idx.items.len())
        };
        gauge!("cache_items", len as f64);
        for n in &notes {
            self.notify(n);
        }
    }

    fn resync(&self) {
        let snapshot: Vec<Arc<Resource>> = lock(&self.index).items.values().cloned().collect();
        debug!(items = snapshot.len(), "resync");
        for r in &snapshot {
            self.notify(&Notification::Updated(Arc::clone(r), Arc::clone(r)));
        }
    }

    fn notify(&self, note: &Notification) {
        let observers = self.observers.load();
        for o in observers.iter() {
            match note {
                Notification::Added(r) => o.on_added(r),
                Notification::Updated(old, new) => o.on_updated(old, new),
                Notification::Deleted(d) => o.on_deleted(d),
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Sleep for `d`; `false` when cancelled first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
