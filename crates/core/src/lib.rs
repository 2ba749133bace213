//! Rekon core types: resource identity, change feed events and the
//! contract a source-of-truth store must satisfy.

#![forbid(unsafe_code)]

mod backoff;
mod key;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use backoff::Backoff;
pub use key::{Key, KeyError};

/// Label pairs carried by a resource.
pub type Labels = SmallVec<[(String, String); 8]>;

/// An externally owned record as observed through the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Empty for cluster-scoped resources.
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    /// Opaque version token assigned by the store.
    pub resource_version: String,
    pub labels: Labels,
    /// Raw object (possibly stripped of oversized fields by the store).
    pub raw: serde_json::Value,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            resource_version: String::new(),
            labels: SmallVec::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.labels.push((k.into(), v.into()));
        self
    }

    pub fn key(&self) -> Key {
        Key::new(self.namespace.clone(), self.name.clone())
    }

    pub fn label(&self, k: &str) -> Option<&str> {
        self.labels.iter().find(|(lk, _)| lk == k).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// One entry of the incremental change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub resource: Resource,
}

/// Full snapshot of the collection at `resource_version`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceList {
    pub resource_version: String,
    pub items: Vec<Resource>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The watch cursor is too old; only a relist can recover.
    #[error("expired: {0}")]
    Expired(String),
    #[error("transient: {0}")]
    Transient(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Source of truth the resource cache is synchronized against.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list(&self) -> Result<ResourceList, StoreError>;

    /// Stream changes that happened after `since_version`. The stream ending
    /// means the caller has to relist before it can trust its view again.
    async fn watch(&self, since_version: &str) -> Result<WatchStream, StoreError>;
}

pub mod prelude {
    pub use super::{
        Backoff, ChangeKind, Key, KeyError, Resource, ResourceList, ResourceStore, StoreError, WatchEvent,
        WatchStream,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_and_labels() {
        let r = Resource::new("prod", "web").with_label("app", "web").with_label("tier", "frontend");
        assert_eq!(r.key(), Key::new("prod", "web"));
        assert_eq!(r.label("tier"), Some("frontend"));
        assert_eq!(r.label("missing"), None);
    }

    #[test]
    fn change_kind_names_are_stable() {
        assert_eq!(ChangeKind::Added.as_str(), "added");
        assert_eq!(ChangeKind::Updated.as_str(), "updated");
        assert_eq!(ChangeKind::Deleted.as_str(), "deleted");
    }
}
