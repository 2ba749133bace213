use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rekon_core::{Key, ResourceStore};
use rekon_queue::WorkQueue;
use rekon_store::ResourceCache;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bridge::{EventBridge, EventFilter};
use crate::worker::{run_worker, WorkerContext};
use crate::{ControllerConfig, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Created => "created",
            ControllerState::Starting => "starting",
            ControllerState::Running => "running",
            ControllerState::Stopping => "stopping",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("shutdown requested before the cache synced")]
    NotSynced,
}

/// One cache, one queue, N workers.
pub struct Controller {
    config: ControllerConfig,
    cache: Arc<ResourceCache>,
    queue: Arc<WorkQueue<Key>>,
    reconciler: Arc<dyn Reconciler>,
    filter: Option<EventFilter>,
    state: watch::Sender<ControllerState>,
}

impl Controller {
    /// Must be called inside a tokio runtime; the queue starts its delay task
    /// immediately.
    pub fn new(config: ControllerConfig, store: Arc<dyn ResourceStore>, reconciler: impl Reconciler) -> Self {
        let cache = Arc::new(ResourceCache::new(store, config.cache.clone()));
        let queue = WorkQueue::new(config.name.clone(), config.queue.rate_limiter::<Key>());
        let (state, _) = watch::channel(ControllerState::Created);
        Self { config, cache, queue, reconciler: Arc::new(reconciler), filter: None, state }
    }

    /// Only enqueue added/updated resources accepted by `filter`.
    pub fn with_event_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn name(&self) -> &str { &self.config.name }

    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }

    pub fn queue(&self) -> &Arc<WorkQueue<Key>> { &self.queue }

    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Sync the cache, run workers until `shutdown` fires, then drain.
    ///
    /// Fails without starting any worker if the cache does not sync within
    /// `sync_timeout` or `shutdown` fires first. Every spawned task is joined
    /// before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let name = self.config.name.clone();
        let workers = self.config.workers.max(1);
        self.set_state(ControllerState::Starting);
        info!(controller = %name, workers, "controller starting");

        let bridge = match self.filter.clone() {
            Some(f) => EventBridge::with_filter(Arc::clone(&self.queue), f),
            None => EventBridge::new(Arc::clone(&self.queue)),
        };
        self.cache.add_observer(Arc::new(bridge));

        let sync_cancel = shutdown.child_token();
        let sync_task = tokio::spawn({
            let cache = Arc::clone(&self.cache);
            let cancel = sync_cancel.clone();
            async move { cache.run(cancel).await }
        });

        let timeout = self.config.sync_timeout;
        let gate = tokio::select! {
            _ = shutdown.cancelled() => Err(ControllerError::NotSynced),
            r = tokio::time::timeout(timeout, self.cache.wait_synced()) => r.map_err(|_| ControllerError::SyncTimeout(timeout)),
        };
        if let Err(e) = gate {
            error!(controller = %name, error = %e, "cache sync failed; not starting workers");
            self.stop(sync_cancel, sync_task, Vec::new()).await;
            return Err(e);
        }
        info!(controller = %name, items = self.cache.len(), "cache synced; starting workers");

        let ctx = Arc::new(WorkerContext {
            controller: name.clone(),
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.cache),
            reconciler: Arc::clone(&self.reconciler),
            max_retries: self.config.max_retries,
        });
        let handles: Vec<JoinHandle<()>> = (0..workers).map(|id| tokio::spawn(run_worker(id, Arc::clone(&ctx)))).collect();
        self.set_state(ControllerState::Running);

        shutdown.cancelled().await;
        self.stop(sync_cancel, sync_task, handles).await;
        Ok(())
    }

    async fn stop(&self, sync_cancel: CancellationToken, sync_task: JoinHandle<()>, workers: Vec<JoinHandle<()>>) {
        self.set_state(ControllerState::Stopping);
        info!(controller = %self.config.name, pending = self.queue.len(), "controller stopping");
        sync_cancel.cancel();
        self.queue.shut_down();
        for (id, w) in workers.into_iter().enumerate() {
            if let Err(e) = w.await {
                error!(controller = %self.config.name, worker = id, error = %e, "worker task failed");
            }
        }
        if let Err(e) = sync_task.await {
            error!(controller = %self.config.name, error = %e, "cache sync task failed");
        }
        self.queue.stopped().await;
        self.set_state(ControllerState::Stopped);
        info!(controller = %self.config.name, "controller stopped");
    }

    fn set_state(&self, s: ControllerState) {
        self.state.send_replace(s);
    }
}
