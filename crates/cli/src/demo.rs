//! In-memory demo: a seeded store, a writer that keeps changing it and a
//! controller that logs every key. Resources labelled `flaky=true` fail their
//! first reconcile at each version to show the retry path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics::counter;
use rekon_controller::{Controller, ControllerConfig, Reconciler};
use rekon_core::prelude::{Key, Resource};
use rekon_store::{MemoryStore, ResourceCache};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::LogReconciler;

const NAMESPACES: [&str; 3] = ["default", "team-a", "team-b"];

fn seed(i: usize) -> Resource {
    let flaky = if i % 5 == 4 { "true" } else { "false" };
    Resource::new(NAMESPACES[i % NAMESPACES.len()], format!("item-{}", i)).with_label("flaky", flaky)
}

#[derive(Default)]
struct DemoReconciler {
    /// Last version that was failed on purpose, per key.
    failed_at: Mutex<HashMap<Key, String>>,
}

#[async_trait::async_trait]
impl Reconciler for DemoReconciler {
    async fn reconcile(&self, key: &Key, cache: &ResourceCache) -> Result<()> {
        if let Some(r) = cache.get_by_key(key) {
            if r.label("flaky") == Some("true") {
                let mut failed = self.failed_at.lock().unwrap_or_else(PoisonError::into_inner);
                if failed.get(key) != Some(&r.resource_version) {
                    failed.insert(key.clone(), r.resource_version.clone());
                    bail!("simulated conflict at version {}", r.resource_version);
                }
            }
        } else {
            self.failed_at.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        }
        LogReconciler.reconcile(key, cache).await
    }
}

async fn churn(store: MemoryStore, items: usize, every: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    let mut n: usize = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        n += 1;
        let r = seed(n.wrapping_mul(7) % items.max(1));
        let key = r.key();
        if n % 6 == 0 && store.delete(&key).is_some() {
            debug!(key = %key, "demo delete");
        } else {
            store.put(r.with_label("gen", n.to_string()));
            debug!(key = %key, "demo write");
        }
        counter!("demo_writes_total", 1u64);
    }
}

pub(crate) async fn run(cfg: ControllerConfig, items: usize, every: Duration, shutdown: CancellationToken) -> Result<()> {
    let store = MemoryStore::with_items((0..items).map(seed));
    let ctl = Controller::new(cfg, Arc::new(store.clone()), DemoReconciler::default());
    let writer = tokio::spawn(churn(store, items, every, shutdown.clone()));
    let out = ctl.run(shutdown.clone()).await;
    shutdown.cancel();
    writer.await.context("demo writer task")?;
    out.context("demo controller")
}
