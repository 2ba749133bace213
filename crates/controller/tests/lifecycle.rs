#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_config, Recorder};
use rekon_controller::{Controller, ControllerError, ControllerState};
use rekon_core::{Key, Resource};
use rekon_store::MemoryStore;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_wait_for_the_first_full_list() {
    let store = MemoryStore::with_items((0..5).map(|i| Resource::new("ns", format!("r{}", i))));
    store.set_list_delay(Duration::from_millis(200));
    let recorder = Recorder::default();
    let ctl = Controller::new(fast_config("gated"), Arc::new(store), recorder.clone());
    let cache = Arc::clone(ctl.cache());
    let mut state = ctl.state();
    assert_eq!(*state.borrow(), ControllerState::Created);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(ctl.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!cache.has_synced());
    assert_eq!(*state.borrow(), ControllerState::Starting);
    assert_eq!(recorder.total(), 0, "no reconcile before sync");

    state.wait_for(|s| *s == ControllerState::Running).await.unwrap();
    eventually("all keys reconciled", || recorder.total() == 5).await;
    assert!(recorder.all_calls_saw_synced_cache());

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(*state.borrow(), ControllerState::Stopped);
}

#[tokio::test]
async fn sync_timeout_is_fatal_and_starts_no_worker() {
    let store = MemoryStore::with_items([Resource::new("ns", "a")]);
    store.fail_next_lists(u32::MAX);
    let recorder = Recorder::default();
    let mut cfg = fast_config("timeout");
    cfg.sync_timeout = Duration::from_millis(100);
    let ctl = Controller::new(cfg, Arc::new(store), recorder.clone());
    let state = ctl.state();
    let queue = Arc::clone(ctl.queue());

    let out = ctl.run(CancellationToken::new()).await;
    assert_eq!(out, Err(ControllerError::SyncTimeout(Duration::from_millis(100))));
    assert_eq!(*state.borrow(), ControllerState::Stopped);
    assert!(queue.is_shutting_down());
    assert_eq!(recorder.total(), 0);
}

#[tokio::test]
async fn shutdown_before_sync_reports_not_synced() {
    let store = MemoryStore::new();
    store.set_list_delay(Duration::from_secs(5));
    let ctl = Controller::new(fast_config("early"), Arc::new(store), Recorder::default());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(ctl.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();
    let out = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(out, Err(ControllerError::NotSynced));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_pending_keys_then_refuses_new_ones() {
    let store = MemoryStore::with_items((0..5).map(|i| Resource::new("ns", format!("r{}", i))));
    let recorder = Recorder::slow(Duration::from_millis(30));
    let mut cfg = fast_config("drain");
    cfg.workers = 1;
    let ctl = Controller::new(cfg, Arc::new(store.clone()), recorder.clone());
    let queue = Arc::clone(ctl.queue());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(ctl.run(shutdown.clone()));

    eventually("first reconcile", || recorder.total() >= 1).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
    assert_eq!(recorder.total(), 5, "queued keys are finished before stop");

    queue.add(Key::new("ns", "late"));
    assert!(queue.is_empty());
    assert_eq!(queue.get().await, None);
    store.put(Resource::new("ns", "after-stop"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(recorder.total(), 5);
}
