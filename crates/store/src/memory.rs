//! In-memory [`ResourceStore`] with a change log, compaction and fault
//! injection. Used by tests and the demo controller.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rekon_core::{ChangeKind, Key, Resource, ResourceList, ResourceStore, StoreError, WatchEvent, WatchStream};
use tokio::sync::watch;

use crate::lock;

#[derive(Default)]
struct MemState {
    version: u64,
    items: BTreeMap<Key, Resource>,
    log: Vec<(u64, WatchEvent)>,
    /// Watches starting before this version get `Expired`.
    compacted: u64,
    generation: u64,
    list_failures: u32,
    list_delay: Duration,
    list_calls: u64,
    watch_calls: u64,
}

struct Inner {
    state: Mutex<MemState>,
    changed: watch::Sender<u64>,
}

/// Cloning shares the same underlying collection.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self { inner: Arc::new(Inner { state: Mutex::new(MemState::default()), changed }) }
    }

    pub fn with_items(items: impl IntoIterator<Item = Resource>) -> Self {
        let store = Self::new();
        for r in items {
            store.put(r);
        }
        store
    }

    /// Create or replace a resource. Returns it with its new version.
    pub fn put(&self, mut resource: Resource) -> Resource {
        let mut st = lock(&self.inner.state);
        st.version += 1;
        resource.resource_version = st.version.to_string();
        let kind = if st.items.contains_key(&resource.key()) { ChangeKind::Updated } else { ChangeKind::Added };
        st.items.insert(resource.key(), resource.clone());
        let v = st.version;
        st.log.push((v, WatchEvent { kind, resource: resource.clone() }));
        self.inner.changed.send_modify(|n| *n += 1);
        resource
    }

    pub fn delete(&self, key: &Key) -> Option<Resource> {
        let mut st = lock(&self.inner.state);
        let mut gone = st.items.remove(key)?;
        st.version += 1;
        gone.resource_version = st.version.to_string();
        let v = st.version;
        st.log.push((v, WatchEvent { kind: ChangeKind::Deleted, resource: gone.clone() }));
        self.inner.changed.send_modify(|n| *n += 1);
        Some(gone)
    }

    pub fn get(&self, key: &Key) -> Option<Resource> {
        lock(&self.inner.state).items.get(key).cloned()
    }

    /// Drop the change log; watches behind the current version expire.
    pub fn compact(&self) {
        let mut st = lock(&self.inner.state);
        st.compacted = st.version;
        st.log.clear();
        self.inner.changed.send_modify(|n| *n += 1);
    }

    /// End every open watch stream, as a server-side timeout would.
    pub fn expire_watches(&self) {
        lock(&self.inner.state).generation += 1;
        self.inner.changed.send_modify(|n| *n += 1);
    }

    /// The next `n` list calls fail with a transient error.
    pub fn fail_next_lists(&self, n: u32) {
        lock(&self.inner.state).list_failures = n;
    }

    pub fn set_list_delay(&self, delay: Duration) {
        lock(&self.inner.state).list_delay = delay;
    }

    pub fn list_calls(&self) -> u64 { lock(&self.inner.state).list_calls }

    pub fn watch_calls(&self) -> u64 { lock(&self.inner.state).watch_calls }
}

struct Cursor {
    inner: Arc<Inner>,
    position: u64,
    generation: u64,
    rx: watch::Receiver<u64>,
    pending: VecDeque<WatchEvent>,
    finished: bool,
}

enum Step {
    Yield(Result<WatchEvent, StoreError>),
    End,
    Wait,
}

impl Cursor {
    fn step(&mut self) -> Step {
        if let Some(ev) = self.pending.pop_front() {
            return Step::Yield(Ok(ev));
        }
        let st = lock(&self.inner.state);
        if st.generation != self.generation {
            return Step::End;
        }
        if self.position < st.compacted {
            self.finished = true;
            return Step::Yield(Err(StoreError::Expired(format!(
                "version {} compacted (oldest {})",
                self.position, st.compacted
            ))));
        }
        let from = self.position;
        for (v, ev) in st.log.iter().filter(|(v, _)| *v > from) {
            self.pending.push_back(ev.clone());
            self.position = *v;
        }
        drop(st);
        match self.pending.pop_front() {
            Some(ev) => Step::Yield(Ok(ev)),
            None => Step::Wait,
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn list(&self) -> Result<ResourceList, StoreError> {
        let delay = {
            let mut st = lock(&self.inner.state);
            st.list_calls += 1;
            if st.list_failures > 0 {
                st.list_failures -= 1;
                return Err(StoreError::Transient("injected list failure".into()));
            }
            st.list_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let st = lock(&self.inner.state);
        Ok(ResourceList { resource_version: st.version.to_string(), items: st.items.values().cloned().collect() })
    }

    async fn watch(&self, since_version: &str) -> Result<WatchStream, StoreError> {
        let position: u64 = if since_version.is_empty() {
            0
        } else {
            since_version
                .parse()
                .map_err(|_| StoreError::Transient(format!("bad resource version {:?}", since_version)))?
        };
        let rx = self.inner.changed.subscribe();
        let generation = {
            let mut st = lock(&self.inner.state);
            st.watch_calls += 1;
            if position < st.compacted {
                return Err(StoreError::Expired(format!("version {} compacted", position)));
            }
            st.generation
        };
        let cursor = Cursor {
            inner: Arc::clone(&self.inner),
            position,
            generation,
            rx,
            pending: VecDeque::new(),
            finished: false,
        };
        let stream = futures::stream::unfold(cursor, |mut c| async move {
            if c.finished {
                return None;
            }
            loop {
                match c.step() {
                    Step::Yield(item) => return Some((item, c)),
                    Step::End => return None,
                    Step::Wait => {
                        if c.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
