//! Rekon controller runtime.
//!
//! Wires a [`ResourceCache`] to a [`WorkQueue`] of keys and drives a pool of
//! workers that call a user [`Reconciler`] for each key. Reconcilers are
//! level-triggered: they receive only the key and read current state from the
//! cache, so any number of coalesced changes lead to one convergent call.

#![forbid(unsafe_code)]

mod bridge;
mod config;
mod controller;
mod worker;

use rekon_core::Key;
use rekon_store::ResourceCache;

pub use bridge::{EventBridge, EventFilter};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, ControllerState};

pub use rekon_queue::WorkQueue;

/// User logic that drives the world toward the state described by the cached
/// resource under `key`. A missing resource means it was deleted.
///
/// Must be idempotent: it may run any number of times for the same state.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &Key, cache: &ResourceCache) -> anyhow::Result<()>;
}
