#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use rekon_controller::{ControllerConfig, Reconciler};
use rekon_core::Key;
use rekon_store::ResourceCache;

/// Records every call and can be told to stall, fail or panic per key.
#[derive(Default)]
pub struct RecorderState {
    calls: Mutex<Vec<Key>>,
    synced_at_call: Mutex<Vec<bool>>,
    active: Mutex<HashSet<Key>>,
    overlapped: AtomicBool,
    failures: Mutex<HashMap<Key, u32>>,
    panics: Mutex<HashSet<Key>>,
    delay: Mutex<Duration>,
    /// Held by a test to park reconciles after they are recorded.
    pub gate: tokio::sync::Mutex<()>,
}

#[derive(Clone, Default)]
pub struct Recorder(pub Arc<RecorderState>);

impl Recorder {
    pub fn slow(delay: Duration) -> Self {
        let p = Self::default();
        *p.0.delay.lock().unwrap() = delay;
        p
    }

    /// Fail the next `n` reconciles of `key`; `u32::MAX` fails forever.
    pub fn fail_times(&self, key: Key, n: u32) {
        self.0.failures.lock().unwrap().insert(key, n);
    }

    pub fn panic_once(&self, key: Key) {
        self.0.panics.lock().unwrap().insert(key);
    }

    pub fn calls_for(&self, key: &Key) -> usize {
        self.0.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    pub fn total(&self) -> usize {
        self.0.calls.lock().unwrap().len()
    }

    pub fn overlapped(&self) -> bool {
        self.0.overlapped.load(Ordering::SeqCst)
    }

    pub fn all_calls_saw_synced_cache(&self) -> bool {
        self.0.synced_at_call.lock().unwrap().iter().all(|s| *s)
    }
}

#[async_trait::async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, key: &Key, cache: &ResourceCache) -> anyhow::Result<()> {
        let s = &self.0;
        {
            s.calls.lock().unwrap().push(key.clone());
            s.synced_at_call.lock().unwrap().push(cache.has_synced());
            if !s.active.lock().unwrap().insert(key.clone()) {
                s.overlapped.store(true, Ordering::SeqCst);
            }
        }
        drop(s.gate.lock().await);
        let delay = *s.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        s.active.lock().unwrap().remove(key);

        if s.panics.lock().unwrap().remove(key) {
            panic!("injected panic for {}", key);
        }
        let fail = {
            let mut failures = s.failures.lock().unwrap();
            match failures.get_mut(key) {
                Some(n) if *n > 0 => {
                    if *n != u32::MAX {
                        *n -= 1;
                    }
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(anyhow!("injected failure for {}", key));
        }
        Ok(())
    }
}

pub fn fast_config(name: &str) -> ControllerConfig {
    let mut cfg = ControllerConfig::named(name);
    cfg.workers = 2;
    cfg.sync_timeout = Duration::from_secs(2);
    cfg.queue.base_delay = Duration::from_millis(10);
    cfg.queue.max_delay = Duration::from_millis(200);
    cfg.cache.watch_backoff_initial = Duration::from_millis(10);
    cfg.cache.watch_backoff_max = Duration::from_millis(50);
    cfg
}

pub async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
