//! Rekon work queue: deduplicating FIFO of item keys with per-item
//! serialization, delayed re-adds and failure backoff.
//!
//! An item is handed to at most one consumer at a time. Adding an item while
//! it is being processed marks it dirty; it is delivered once more after
//! `done`, no matter how many times it was re-added.

#![forbid(unsafe_code)]

mod rate_limit;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    QueueConfig, RateLimiter,
};

/// Anything usable as a queue item.
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueItem for T {}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    enqueued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    shutting_down: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            enqueued_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            shutting_down: false,
        }
    }
}

pub struct WorkQueue<T: QueueItem> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    idle: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    delay_tx: mpsc::UnboundedSender<Waiting<T>>,
    stop: CancellationToken,
    delay_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: QueueItem> WorkQueue<T> {
    /// Create a queue and spawn its delay loop on the current tokio runtime.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Arc<Self> {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let q = Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            idle: Notify::new(),
            limiter: Box::new(limiter),
            delay_tx,
            stop: CancellationToken::new(),
            delay_task: Mutex::new(None),
        });
        let handle = tokio::spawn(delay_loop(Arc::downgrade(&q), delay_rx, q.stop.clone()));
        *lock(&q.delay_task) = Some(handle);
        q
    }

    /// Queue with [`default_controller_rate_limiter`].
    pub fn with_default_limiter(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, default_controller_rate_limiter::<T>())
    }

    pub fn name(&self) -> &str { &self.name }

    /// Number of items waiting to be handed out (not counting in-flight or delayed).
    pub fn len(&self) -> usize { lock(&self.state).queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { lock(&self.state).shutting_down }

    pub fn add(&self, item: T) {
        let mut st = lock(&self.state);
        if st.shutting_down {
            debug!(queue = %self.name, item = ?item, "add ignored: shutting down");
            return;
        }
        if st.dirty.contains(&item) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            debug!(queue = %self.name, item = ?item, "item in flight; marked for redelivery");
            return;
        }
        st.enqueued_at.entry(item.clone()).or_insert_with(Instant::now);
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.ready.notify_one();
    }

    /// Wait for the next item. `None` means the queue is shut down and empty.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = lock(&self.state);
                if let Some(item) = st.queue.pop_front() {
                    st.processing.insert(item.clone());
                    st.dirty.remove(&item);
                    if let Some(at) = st.enqueued_at.remove(&item) {
                        histogram!("workqueue_queue_duration_ms", at.elapsed().as_secs_f64() * 1000.0, "queue" => self.name.clone());
                    }
                    st.started_at.insert(item.clone(), Instant::now());
                    gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`; redelivers it if it was re-added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = lock(&self.state);
        if !st.processing.remove(item) {
            return;
        }
        if let Some(at) = st.started_at.remove(item) {
            histogram!("workqueue_work_duration_ms", at.elapsed().as_secs_f64() * 1000.0, "queue" => self.name.clone());
        }
        let requeue = st.dirty.contains(item);
        if requeue {
            st.enqueued_at.insert(item.clone(), Instant::now());
            st.queue.push_back(item.clone());
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeue {
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Add `item` once `delay` has elapsed. Earlier pending deadlines win.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let w = Waiting { ready_at: Instant::now() + delay, seq: 0, item };
        if self.delay_tx.send(w).is_err() {
            warn!(queue = %self.name, "delay loop gone; dropping delayed add");
        }
    }

    /// Re-add after the rate limiter's backoff for this item. Returns the delay.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "queue" => self.name.clone());
        self.add_after(item, delay);
        delay
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Stop accepting items. Pending items are still handed out; `get`
    /// returns `None` once the queue is empty.
    pub fn shut_down(&self) {
        {
            let mut st = lock(&self.state);
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        info!(queue = %self.name, "work queue shutting down");
        self.stop.cancel();
        self.ready.notify_waiters();
    }

    /// Shut down, then wait until no item is in flight.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.state).processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Join the delay loop. Only meaningful after `shut_down`.
    pub async fn stopped(&self) {
        let handle = lock(&self.delay_task).take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                warn!(queue = %self.name, error = %e, "delay loop ended abnormally");
            }
        }
    }
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

// Min-heap on (ready_at, seq).
impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<T> Eq for Waiting<T> {}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn delay_loop<T: QueueItem>(
    queue: Weak<WorkQueue<T>>,
    mut rx: mpsc::UnboundedReceiver<Waiting<T>>,
    stop: CancellationToken,
) {
    let mut heap: BinaryHeap<Waiting<T>> = BinaryHeap::new();
    let mut deadlines: FxHashMap<T, Instant> = FxHashMap::default();
    let mut seq: u64 = 0;
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = heap.pop() else { break };
            // Superseded by an earlier deadline that already fired.
            if deadlines.get(&w.item) != Some(&w.ready_at) {
                continue;
            }
            deadlines.remove(&w.item);
            match queue.upgrade() {
                Some(q) => q.add(w.item),
                None => return,
            }
        }
        let next = heap.peek().map(|w| w.ready_at);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep_until_opt(next) => {}
            msg = rx.recv() => match msg {
                Some(mut w) => {
                    let earlier = deadlines.get(&w.item).is_some_and(|d| *d <= w.ready_at);
                    if !earlier {
                        deadlines.insert(w.item.clone(), w.ready_at);
                        seq += 1;
                        w.seq = seq;
                        heap.push(w);
                    }
                }
                None => break,
            },
        }
    }
    debug!(pending = deadlines.len(), "delay loop stopped");
}
