use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tether_core::{Error, Object, ObjectKey, Result};

/// Name of the built-in namespace index.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Values an object is filed under in one index. Most objects yield one.
pub type IndexValues = SmallVec<[String; 2]>;

pub type IndexFn<K> = Arc<dyn Fn(&K) -> IndexValues + Send + Sync>;

/// Files an object under its namespace; cluster-scoped objects land under "".
pub fn namespace_index<K: Object>(obj: &K) -> IndexValues {
    smallvec![obj.namespace().unwrap_or("").to_string()]
}

/// Named index functions.
pub struct Indexers<K> {
    fns: FxHashMap<String, IndexFn<K>>,
}

impl<K> Default for Indexers<K> {
    fn default() -> Self {
        Self { fns: FxHashMap::default() }
    }
}

impl<K> Clone for Indexers<K> {
    fn clone(&self) -> Self {
        Self { fns: self.fns.clone() }
    }
}

impl<K> std::fmt::Debug for Indexers<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.fns.keys()).finish()
    }
}

impl<K: Object> Indexers<K> {
    /// Indexers with just the namespace index.
    pub fn namespaced() -> Self {
        Self::default().with(NAMESPACE_INDEX, namespace_index::<K>)
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&K) -> IndexValues + Send + Sync + 'static,
    {
        self.fns.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fns.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Merge `other` into self; fails without changes on a name collision.
    pub(crate) fn merge(&mut self, other: Indexers<K>) -> Result<()> {
        if let Some(dup) = other.fns.keys().find(|n| self.fns.contains_key(*n)) {
            return Err(Error::IndexExists(dup.clone()));
        }
        self.fns.extend(other.fns);
        Ok(())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &IndexFn<K>)> {
        self.fns.iter()
    }
}

/// index name -> index value -> primary keys
pub(crate) type Indices = FxHashMap<String, FxHashMap<String, FxHashSet<ObjectKey>>>;

/// Move `key` from the buckets of `old` into the buckets of `new`.
pub(crate) fn reindex<K: Object>(
    indexers: &Indexers<K>,
    indices: &mut Indices,
    key: &ObjectKey,
    old: Option<&K>,
    new: Option<&K>,
) {
    for (name, f) in indexers.iter() {
        let old_vals = old.map(|o| f(o)).unwrap_or_default();
        let new_vals = new.map(|o| f(o)).unwrap_or_default();
        let index = indices.entry(name.clone()).or_default();
        for v in old_vals.iter().filter(|v| !new_vals.contains(v)) {
            if let Some(bucket) = index.get_mut(v) {
                bucket.remove(key);
                if bucket.is_empty() {
                    index.remove(v);
                }
            }
        }
        for v in new_vals {
            index.entry(v).or_default().insert(key.clone());
        }
    }
}
