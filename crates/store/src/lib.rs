//! Tether store: keyed in-RAM cache with secondary indexes.
//!
//! `store()` returns a split pair: a single [`Writer`] owned by the
//! synchronization loop and a cloneable [`Store`] read handle. Every write
//! updates the object map and all indexes under one lock, so readers never see
//! a half-applied object.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tether_core::{Delta, Error, Object, ObjectKey, Result};
use tokio::sync::watch;
use tracing::debug;

mod index;

pub use index::{namespace_index, IndexFn, IndexValues, Indexers, NAMESPACE_INDEX};

/// Read contract shared by the live store and test doubles.
pub trait Indexer<K>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;

    /// Lookup by `namespace/name` (or `name`) string key.
    fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        ObjectKey::parse(key).ok().and_then(|k| self.get(&k))
    }

    /// Snapshot of all objects, unordered.
    fn list(&self) -> Vec<Arc<K>>;
    fn list_keys(&self) -> Vec<ObjectKey>;
    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>>;
    fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>>;
    /// All values currently present in an index.
    fn list_index_values(&self, index: &str) -> Vec<String>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indices: index::Indices,
    indexers: Indexers<K>,
}

impl<K: Object> Inner<K> {
    fn insert(&mut self, obj: K) -> Delta<K> {
        let key = obj.key();
        let new = Arc::new(obj);
        let old = self.items.insert(key.clone(), Arc::clone(&new));
        index::reindex(&self.indexers, &mut self.indices, &key, old.as_deref(), Some(&*new));
        match old {
            Some(old) => Delta::Updated { old, new },
            None => Delta::Added(new),
        }
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<K>> {
        let old = self.items.remove(key)?;
        index::reindex(&self.indexers, &mut self.indices, key, Some(&*old), None);
        Some(old)
    }

    fn bucket(&self, index: &str, value: &str) -> Result<Option<&FxHashSet<ObjectKey>>> {
        if !self.indexers.contains(index) {
            return Err(Error::UnknownIndex(index.to_string()));
        }
        Ok(self.indices.get(index).and_then(|idx| idx.get(value)))
    }
}

struct Shared<K> {
    inner: RwLock<Inner<K>>,
    epoch_tx: watch::Sender<u64>,
}

impl<K> Shared<K> {
    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable read handle.
pub struct Store<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K> std::fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("epoch", &*self.shared.epoch_tx.borrow()).finish()
    }
}

impl<K: Object> Store<K> {
    /// Epoch bumps once per committed write batch.
    pub fn epoch(&self) -> u64 {
        *self.shared.epoch_tx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.shared.epoch_tx.subscribe()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.shared.read().indexers.names().map(str::to_string).collect()
    }
}

impl<K: Object> Indexer<K> for Store<K> {
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.shared.read().items.get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.shared.read().items.values().cloned().collect()
    }

    fn list_keys(&self) -> Vec<ObjectKey> {
        self.shared.read().items.keys().cloned().collect()
    }

    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.shared.read();
        let Some(bucket) = inner.bucket(index, value)? else { return Ok(Vec::new()) };
        Ok(bucket.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let inner = self.shared.read();
        Ok(inner.bucket(index, value)?.map(|b| b.iter().cloned().collect()).unwrap_or_default())
    }

    fn list_index_values(&self, index: &str) -> Vec<String> {
        self.shared
            .read()
            .indices
            .get(index)
            .map(|idx| idx.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.shared.read().items.len()
    }
}

/// Sole mutator of a store. Not cloneable.
pub struct Writer<K> {
    shared: Arc<Shared<K>>,
}

/// Create an empty store with the given indexers.
pub fn store<K: Object>(indexers: Indexers<K>) -> (Writer<K>, Store<K>) {
    let (epoch_tx, _) = watch::channel(0u64);
    let shared = Arc::new(Shared {
        inner: RwLock::new(Inner {
            items: FxHashMap::default(),
            indices: index::Indices::default(),
            indexers,
        }),
        epoch_tx,
    });
    (Writer { shared: Arc::clone(&shared) }, Store { shared })
}

impl<K: Object> Writer<K> {
    pub fn store(&self) -> Store<K> {
        Store { shared: Arc::clone(&self.shared) }
    }

    fn bump(&self) {
        self.shared.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
    }

    /// Insert or replace an object.
    pub fn upsert(&mut self, obj: K) -> Delta<K> {
        let delta = self.shared.write().insert(obj);
        self.bump();
        delta
    }

    /// Remove an object; unknown keys are a no-op.
    pub fn remove(&mut self, obj: &K) -> Option<Delta<K>> {
        let removed = self.shared.write().remove(&obj.key());
        let delta = removed.map(Delta::Deleted)?;
        self.bump();
        Some(delta)
    }

    /// Replace the whole contents with a fresh snapshot.
    ///
    /// Yields `Added` or `Updated` in snapshot order for new or changed
    /// objects, then `Deleted` for keys the snapshot no longer has. Objects
    /// equal to the stored value yield nothing.
    pub fn replace(&mut self, items: Vec<K>) -> Vec<Delta<K>> {
        let mut inner = self.shared.write();
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut out = Vec::new();
        for obj in items {
            let key = obj.key();
            if !seen.insert(key.clone()) {
                debug!(key = %key, "duplicate key in snapshot; last one wins");
            }
            if inner.items.get(&key).is_some_and(|cur| **cur == obj) {
                continue;
            }
            out.push(inner.insert(obj));
        }
        let mut gone: Vec<ObjectKey> = inner.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        gone.sort_unstable();
        for key in gone {
            if let Some(old) = inner.remove(&key) {
                out.push(Delta::Deleted(old));
            }
        }
        drop(inner);
        self.bump();
        debug!(changes = out.len(), "store replaced");
        out
    }

    /// `Updated(o, o)` for every stored object; contents are untouched.
    pub fn resync(&self) -> Vec<Delta<K>> {
        self.shared
            .read()
            .items
            .values()
            .map(|o| Delta::Updated { old: Arc::clone(o), new: Arc::clone(o) })
            .collect()
    }

    /// Add index functions and file every stored object under them.
    pub fn add_indexers(&mut self, indexers: Indexers<K>) -> Result<()> {
        let mut guard = self.shared.write();
        let inner = &mut *guard;
        let fresh = indexers.clone();
        inner.indexers.merge(indexers)?;
        for (key, obj) in inner.items.iter() {
            index::reindex(&fresh, &mut inner.indices, key, None, Some(&**obj));
        }
        Ok(())
    }
}
