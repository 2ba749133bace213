use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use rekon_core::Key;
use rekon_queue::WorkQueue;
use rekon_store::ResourceCache;
use tracing::{debug, error, warn};

use crate::Reconciler;

pub(crate) struct WorkerContext {
    pub(crate) controller: String,
    pub(crate) queue: Arc<WorkQueue<Key>>,
    pub(crate) cache: Arc<ResourceCache>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) max_retries: Option<u32>,
}

/// Pull keys until the queue is shut down and drained.
pub(crate) async fn run_worker(id: usize, ctx: Arc<WorkerContext>) {
    debug!(worker = id, controller = %ctx.controller, "worker started");
    while let Some(key) = ctx.queue.get().await {
        process(id, &ctx, &key).await;
        ctx.queue.done(&key);
    }
    debug!(worker = id, controller = %ctx.controller, "worker exited");
}

async fn process(id: usize, ctx: &WorkerContext, key: &Key) {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(ctx.reconciler.reconcile(key, &ctx.cache)).catch_unwind().await;
    histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => ctx.controller.clone());

    let failure = match outcome {
        Ok(Ok(())) => {
            counter!("reconcile_total", 1u64, "controller" => ctx.controller.clone(), "result" => "ok");
            ctx.queue.forget(key);
            debug!(worker = id, key = %key, "reconciled");
            return;
        }
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => format!("reconciler panicked: {}", panic_message(&*panic)),
    };

    if let Some(max) = ctx.max_retries {
        let attempts = ctx.queue.num_requeues(key);
        if attempts >= max {
            counter!("reconcile_total", 1u64, "controller" => ctx.controller.clone(), "result" => "dropped");
            ctx.queue.forget(key);
            error!(worker = id, key = %key, attempts, error = %failure, "giving up on key");
            return;
        }
    }

    counter!("reconcile_total", 1u64, "controller" => ctx.controller.clone(), "result" => "error");
    let delay = ctx.queue.add_rate_limited(key.clone());
    warn!(worker = id, key = %key, delay_ms = delay.as_millis() as u64, error = %failure, "reconcile failed; requeued");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string payload"
    }
}
