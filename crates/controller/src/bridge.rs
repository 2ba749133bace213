use std::sync::Arc;

use rekon_core::{Key, Resource};
use rekon_queue::WorkQueue;
use rekon_store::{DeletedResource, ResourceObserver};
use tracing::debug;

/// Decides whether an added or updated resource is worth enqueueing.
/// Deletions are always enqueued.
pub type EventFilter = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

/// Turns cache notifications into queued keys.
pub struct EventBridge {
    queue: Arc<WorkQueue<Key>>,
    filter: Option<EventFilter>,
}

impl EventBridge {
    pub fn new(queue: Arc<WorkQueue<Key>>) -> Self {
        Self { queue, filter: None }
    }

    pub fn with_filter(queue: Arc<WorkQueue<Key>>, filter: EventFilter) -> Self {
        Self { queue, filter: Some(filter) }
    }

    fn enqueue(&self, key: Key, event: &'static str) {
        debug!(key = %key, queue = self.queue.name(), event, "enqueue");
        self.queue.add(key);
    }

    fn admits(&self, r: &Resource) -> bool {
        self.filter.as_ref().map_or(true, |f| f(r))
    }
}

impl ResourceObserver for EventBridge {
    fn on_added(&self, resource: &Arc<Resource>) {
        if self.admits(resource) {
            self.enqueue(resource.key(), "added");
        }
    }

    fn on_updated(&self, _old: &Arc<Resource>, new: &Arc<Resource>) {
        if self.admits(new) {
            self.enqueue(new.key(), "updated");
        }
    }

    fn on_deleted(&self, deleted: &DeletedResource) {
        self.enqueue(deleted.key(), "deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_transition_enqueues_its_key() {
        let q = WorkQueue::with_default_limiter("bridge");
        let bridge = EventBridge::new(Arc::clone(&q));
        let a = Arc::new(Resource::new("ns", "a"));
        let b = Arc::new(Resource::new("", "b"));
        bridge.on_added(&a);
        bridge.on_updated(&a, &a);
        bridge.on_deleted(&DeletedResource::Tombstone { key: b.key(), last_known: Arc::clone(&b) });
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(Key::new("ns", "a")));
        assert_eq!(q.get().await, Some(Key::cluster("b")));
    }

    #[tokio::test]
    async fn filter_skips_updates_but_not_deletes() {
        let q = WorkQueue::with_default_limiter("filtered");
        let only_web: EventFilter = Arc::new(|r: &Resource| r.label("app") == Some("web"));
        let bridge = EventBridge::with_filter(Arc::clone(&q), only_web);
        let db = Arc::new(Resource::new("ns", "db").with_label("app", "db"));
        bridge.on_added(&db);
        bridge.on_updated(&db, &db);
        assert!(q.is_empty());
        bridge.on_deleted(&DeletedResource::Final(db));
        assert_eq!(q.get().await, Some(Key::new("ns", "db")));
    }
}
