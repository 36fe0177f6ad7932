use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

/// A cached resource instance. Equality is used to detect content changes
/// when a fresh list is reconciled against the store.
pub trait Object: Clone + PartialEq + Send + Sync + 'static {
    fn name(&self) -> &str;
    /// `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;
    fn resource_version(&self) -> Option<&str>;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

/// Primary store key: `namespace/name`, or `name` for cluster-scoped objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn parse(key: &str) -> Result<Self> {
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(Error::Malformed(format!("invalid object key: {}", key))),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Schema-less object: identity and version lifted out of the raw payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynObject {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    pub uid: Option<String>,
    pub labels: SmallVec<[(String, String); 8]>,
    /// Full object as served by the remote authority.
    pub raw: serde_json::Value,
}

impl DynObject {
    pub fn new(namespace: Option<&str>, name: &str, resource_version: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            resource_version: Some(resource_version.to_string()),
            uid: None,
            labels: SmallVec::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Decode the raw payload into a typed resource.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.raw.clone())
            .map_err(|e| Error::Malformed(format!("{}: {}", self.key(), e)))
    }
}

impl Object for DynObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }
}
