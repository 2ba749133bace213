use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a resource: `(namespace, name)`. Namespace is empty for
/// cluster-scoped resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key: {0:?} (expect name or namespace/name)")]
    Invalid(String),
}

impl Key {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

/// Renders `namespace/name`, or `name` when cluster-scoped.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Key::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Key::new(*ns, *name)),
            _ => Err(KeyError::Invalid(s.to_string())),
        }
    }
}
