//! Types shared by every custom resource in this operator

use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another namespaced resource
///
/// An omitted namespace means "the namespace of the referencing resource".
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Name of the referenced resource
    pub name: String,

    /// Namespace of the referenced resource (defaults to the referencing resource's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Resolve the reference against the namespace of the resource holding it
    pub fn resolve(&self, default_namespace: &str) -> ObjectKey {
        ObjectKey {
            namespace: self
                .namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .unwrap_or(default_namespace)
                .to_string(),
            name: self.name.clone(),
        }
    }
}

/// Fully-qualified identity of a namespaced resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Parse a duration string like "30s", "5m", "1h", "7d" or a bare number of seconds
pub fn parse_duration(duration: &str) -> Option<Duration> {
    let duration = duration.trim();
    if duration.is_empty() {
        return None;
    }

    let (num_str, multiplier) = if let Some(n) = duration.strip_suffix("ms") {
        return n.parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(n) = duration.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = duration.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = duration.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = duration.strip_suffix('d') {
        (n, 86400)
    } else {
        // Assume seconds if no suffix
        (duration, 1)
    };

    num_str
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_secs(n * multiplier))
}
