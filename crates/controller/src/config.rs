use std::str::FromStr;
use std::time::Duration;

use rekon_queue::QueueConfig;
use rekon_store::CacheConfig;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Used for the queue name, log fields and metric labels.
    pub name: String,
    pub workers: usize,
    /// How long `run` waits for the first full list before failing.
    pub sync_timeout: Duration,
    /// `None` retries failed keys forever.
    pub max_retries: Option<u32>,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "rekon".to_string(),
            workers: 2,
            sync_timeout: Duration::from_secs(60),
            max_retries: None,
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Defaults overridden by `REKON_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    /// Invalid values are logged and ignored.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = parse_where(&get, "REKON_WORKERS", |n: &usize| *n > 0) {
            cfg.workers = n;
        }
        if let Some(s) = parse::<u64>(&get, "REKON_SYNC_TIMEOUT_SECS") {
            cfg.sync_timeout = Duration::from_secs(s);
        }
        if let Some(n) = parse::<u32>(&get, "REKON_MAX_RETRIES") {
            cfg.max_retries = Some(n);
        }
        if let Some(s) = parse::<u64>(&get, "REKON_RESYNC_SECS") {
            cfg.cache.resync_period = (s > 0).then(|| Duration::from_secs(s));
        }
        if let Some(s) = parse_where(&get, "REKON_WATCH_BACKOFF_MAX_SECS", |s: &u64| *s > 0) {
            cfg.cache.watch_backoff_max = Duration::from_secs(s);
        }
        if let Some(ms) = parse::<u64>(&get, "REKON_BACKOFF_BASE_MS") {
            cfg.queue.base_delay = Duration::from_millis(ms);
        }
        if let Some(s) = parse::<u64>(&get, "REKON_BACKOFF_MAX_SECS") {
            cfg.queue.max_delay = Duration::from_secs(s);
        }
        if let Some(q) = parse_where(&get, "REKON_QPS", |q: &f64| q.is_finite() && *q > 0.0) {
            cfg.queue.qps = q;
        }
        if let Some(b) = parse_where(&get, "REKON_BURST", |b: &u32| *b > 0) {
            cfg.queue.burst = b;
        }
        cfg
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    parse_where(get, var, |_| true)
}

fn parse_where<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &str, valid: impl Fn(&T) -> bool) -> Option<T> {
    let raw = get(var)?;
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => Some(v),
        _ => {
            warn!(var, value = %raw, "invalid config value; using default");
            None
        }
    }
}
