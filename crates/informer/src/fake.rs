//! Network-free informer seeded with fixed objects, for consumer unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tether_core::{Error, Object, Result};
use tether_store::{Indexer, Indexers, Store, Writer};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::HandlerId;
use crate::handler::{ResourceEventHandler, TransformFn, WatchErrorHandler};
use crate::informer::SharedIndexInformer;

/// Read contract matches the live store; every mutation is refused.
/// Registered handlers are accepted and never invoked. Extra indexes merge
/// into the seeded store and index its objects immediately.
pub struct FakeInformer<K: Object> {
    store: Store<K>,
    writer: Mutex<Writer<K>>,
    next_id: AtomicU64,
}

impl<K: Object> FakeInformer<K> {
    /// Seed with the namespace index.
    pub fn new(objects: impl IntoIterator<Item = K>) -> Self {
        Self::with_indexers(objects, Indexers::namespaced())
    }

    pub fn with_indexers(objects: impl IntoIterator<Item = K>, indexers: Indexers<K>) -> Self {
        let (mut writer, store) = tether_store::store(indexers);
        writer.replace(objects.into_iter().collect());
        Self { store, writer: Mutex::new(writer), next_id: AtomicU64::new(1) }
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    pub fn add(&self, _obj: K) -> Result<()> {
        Err(Error::Unsupported("add"))
    }

    pub fn update(&self, _obj: K) -> Result<()> {
        Err(Error::Unsupported("update"))
    }

    pub fn delete(&self, _obj: &K) -> Result<()> {
        Err(Error::Unsupported("delete"))
    }

    pub fn replace(&self, _objects: Vec<K>) -> Result<()> {
        Err(Error::Unsupported("replace"))
    }

    pub fn resync(&self) -> Result<()> {
        Err(Error::Unsupported("resync"))
    }

    fn handle(&self) -> HandlerId {
        HandlerId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl<K: Object> SharedIndexInformer<K> for FakeInformer<K> {
    fn indexer(&self) -> &dyn Indexer<K> {
        &self.store
    }

    fn add_event_handler(&self, _handler: Arc<dyn ResourceEventHandler<K>>) -> Result<HandlerId> {
        Ok(self.handle())
    }

    fn add_event_handler_with_resync(
        &self,
        _handler: Arc<dyn ResourceEventHandler<K>>,
        _resync: Duration,
    ) -> Result<HandlerId> {
        Ok(self.handle())
    }

    fn remove_event_handler(&self, _id: HandlerId) -> Result<()> {
        Err(Error::Unsupported("remove_event_handler"))
    }

    fn add_indexers(&self, indexers: Indexers<K>) -> Result<()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).add_indexers(indexers)
    }

    fn set_watch_error_handler(&self, _handler: WatchErrorHandler) -> Result<()> {
        Ok(())
    }

    fn set_transform(&self, _transform: TransformFn<K>) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn has_synced(&self) -> bool {
        true
    }

    fn is_stopped(&self) -> bool {
        false
    }

    fn last_sync_resource_version(&self) -> String {
        String::new()
    }
}
