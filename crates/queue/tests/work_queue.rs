#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rekon_queue::{ItemExponentialFailureRateLimiter, WorkQueue};

fn queue(name: &str) -> Arc<WorkQueue<String>> {
    WorkQueue::new(name, ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)))
}

async fn next_within(q: &WorkQueue<String>, ms: u64) -> Option<String> {
    tokio::time::timeout(Duration::from_millis(ms), q.get()).await.ok().flatten()
}

#[tokio::test]
async fn duplicate_adds_while_pending_coalesce() {
    let q = queue("pending");
    q.add("a".into());
    q.add("a".into());
    q.add("b".into());
    q.add("a".into());
    assert_eq!(q.len(), 2);
    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert_eq!(q.get().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn adds_while_in_flight_yield_exactly_one_redelivery() {
    let q = queue("inflight");
    q.add("k".into());
    let k = q.get().await.unwrap();
    for _ in 0..7 {
        q.add("k".into());
    }
    assert_eq!(q.len(), 0, "in-flight key must not be queued twice");
    assert!(next_within(&q, 30).await.is_none(), "no concurrent delivery of an in-flight key");

    q.done(&k);
    let again = next_within(&q, 100).await;
    assert_eq!(again.as_deref(), Some("k"));
    q.done(&"k".to_string());
    assert!(next_within(&q, 50).await.is_none(), "exactly two deliveries in total");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_hands_one_key_to_two_workers() {
    let q = queue("overlap");
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let q = Arc::clone(&q);
        let active = Arc::clone(&active);
        let max_seen = Arc::clone(&max_seen);
        let deliveries = Arc::clone(&deliveries);
        workers.push(tokio::spawn(async move {
            while let Some(k) = q.get().await {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                deliveries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                q.done(&k);
            }
        }));
    }

    let mut adders = Vec::new();
    for _ in 0..8 {
        let q = Arc::clone(&q);
        adders.push(tokio::spawn(async move {
            for _ in 0..20 {
                q.add("hot".into());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }));
    }
    for a in adders {
        a.await.unwrap();
    }
    q.shut_down_with_drain().await;
    for w in workers {
        w.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(deliveries.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn get_blocks_until_an_item_arrives() {
    let q = queue("blocking");
    let getter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!getter.is_finished());
    q.add("late".into());
    let got = tokio::time::timeout(Duration::from_secs(1), getter).await.unwrap().unwrap();
    assert_eq!(got.as_deref(), Some("late"));
}

#[tokio::test]
async fn shutdown_rejects_new_items_and_drains_pending() {
    let q = queue("drain");
    q.add("before".into());
    q.shut_down();
    q.add("after".into());
    assert_eq!(q.get().await.as_deref(), Some("before"));
    assert_eq!(q.get().await, None);
    assert_eq!(q.get().await, None);
    q.stopped().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_releases_every_blocked_getter() {
    let q = queue("release");
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    for g in getters {
        let out = tokio::time::timeout(Duration::from_secs(1), g).await.unwrap().unwrap();
        assert!(out.is_none());
    }
}

#[tokio::test]
async fn drain_waits_for_in_flight_items() {
    let q = queue("wait");
    q.add("k".into());
    let k = q.get().await.unwrap();
    let drain = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.shut_down_with_drain().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain.is_finished());
    q.done(&k);
    tokio::time::timeout(Duration::from_secs(1), drain).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn add_after_delivers_once_the_delay_elapses() {
    let q = queue("after");
    let t0 = tokio::time::Instant::now();
    q.add_after("k".into(), Duration::from_millis(100));
    assert!(next_within(&q, 50).await.is_none());
    assert_eq!(q.get().await.as_deref(), Some("k"));
    assert!(t0.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn earliest_pending_deadline_wins() {
    let q = queue("earliest");
    let t0 = tokio::time::Instant::now();
    q.add_after("k".into(), Duration::from_millis(200));
    q.add_after("k".into(), Duration::from_millis(50));
    let k = q.get().await.unwrap();
    let at = t0.elapsed();
    assert!(at >= Duration::from_millis(50) && at < Duration::from_millis(200), "delivered at {:?}", at);
    q.done(&k);
    assert!(next_within(&q, 500).await.is_none(), "superseded deadline must not redeliver");
}

#[tokio::test(start_paused = true)]
async fn rate_limited_requeue_backs_off_until_forgotten() {
    let q = queue("backoff");
    let d1 = q.add_rate_limited("k".into());
    let k = q.get().await.unwrap();
    q.done(&k);
    let d2 = q.add_rate_limited("k".into());
    assert_eq!(d1, Duration::from_millis(10));
    assert_eq!(d2, Duration::from_millis(20));
    assert_eq!(q.num_requeues(&k), 2);

    let k = q.get().await.unwrap();
    q.forget(&k);
    q.done(&k);
    assert_eq!(q.num_requeues(&k), 0);
    assert_eq!(q.add_rate_limited("k".into()), Duration::from_millis(10));
}
