//! Tether core types: objects, keys, selectors and the list/watch contract.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod error;
mod listwatch;
mod object;

pub use error::{Error, Result};
pub use listwatch::{ListResult, ListWatcher, WatchEvent, WatchStream};
pub use object::{DynObject, Object, ObjectKey};

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, DynObject, Error, ListResult, ListWatcher, Object, ObjectKey, Result,
        Selector, WatchEvent, WatchStream,
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

/// A change notification delivered to handlers. The store already reflects it
/// by the time it is produced.
#[derive(Debug)]
pub enum Delta<K> {
    Added(Arc<K>),
    /// `old` and `new` are the same object for resync notifications.
    Updated { old: Arc<K>, new: Arc<K> },
    /// Carries the last known state of the object.
    Deleted(Arc<K>),
}

// Manual impl: derive would demand `K: Clone`.
impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        match self {
            Delta::Added(o) => Delta::Added(Arc::clone(o)),
            Delta::Updated { old, new } => Delta::Updated { old: Arc::clone(old), new: Arc::clone(new) },
            Delta::Deleted(o) => Delta::Deleted(Arc::clone(o)),
        }
    }
}

impl<K: Object> Delta<K> {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Delta::Added(_) => DeltaKind::Added,
            Delta::Updated { .. } => DeltaKind::Updated,
            Delta::Deleted(_) => DeltaKind::Deleted,
        }
    }

    /// The object the delta is about (the new state for updates).
    pub fn object(&self) -> &Arc<K> {
        match self {
            Delta::Added(o) | Delta::Deleted(o) => o,
            Delta::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }
}

/// Scope of a list/watch. All fields are passed to the remote authority verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Selector {
    /// `None` selects all namespaces.
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), ..Self::default() }
    }

    pub fn fields(mut self, expr: impl Into<String>) -> Self {
        self.field_selector = Some(expr.into());
        self
    }

    pub fn labels(mut self, expr: impl Into<String>) -> Self {
        self.label_selector = Some(expr.into());
        self
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ns={}", self.namespace.as_deref().unwrap_or("(all)"))?;
        if let Some(fs) = &self.field_selector {
            write!(f, " fields={}", fs)?;
        }
        if let Some(ls) = &self.label_selector {
            write!(f, " labels={}", ls)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_display_and_builders() {
        let s = Selector::namespaced("ns1").labels("app=web").fields("status.phase=Running");
        assert_eq!(s.to_string(), "ns=ns1 fields=status.phase=Running labels=app=web");
        assert_eq!(Selector::all().to_string(), "ns=(all)");
    }

    #[test]
    fn delta_key_follows_new_object() {
        let old = Arc::new(DynObject::new(Some("ns"), "a", "1"));
        let new = Arc::new(DynObject::new(Some("ns"), "a", "2"));
        let d = Delta::Updated { old, new: Arc::clone(&new) };
        assert_eq!(d.kind(), DeltaKind::Updated);
        assert_eq!(d.object().resource_version(), Some("2"));
        assert_eq!(d.key().to_string(), "ns/a");
    }
}
