use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_core::{Error, ListWatcher, Object, Result, Selector};
use tether_store::{Indexer, Indexers, Store, Writer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::InformerConfig;
use crate::dispatcher::{Dispatcher, HandlerId};
use crate::handler::{default_watch_error_handler, ResourceEventHandler, TransformFn, WatchErrorHandler};
use crate::reflector::Reflector;

/// Reflector loop states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listing,
    Syncing,
    Watching,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: Phase,
    /// Set once the first list has been stored; never cleared.
    pub synced: bool,
    /// Latest resume token seen on a list, event or bookmark.
    pub resource_version: String,
    /// Objects in the store after the last applied change.
    pub objects: usize,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self { phase: Phase::Idle, synced: false, resource_version: String::new(), objects: 0 }
    }
}

/// Informer surface shared by [`Informer`] and [`crate::FakeInformer`].
#[async_trait::async_trait]
pub trait SharedIndexInformer<K: Object>: Send + Sync {
    fn indexer(&self) -> &dyn Indexer<K>;

    /// Handler resyncs at the informer's default period.
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) -> Result<HandlerId>;

    fn add_event_handler_with_resync(
        &self,
        handler: Arc<dyn ResourceEventHandler<K>>,
        resync: Duration,
    ) -> Result<HandlerId>;

    fn remove_event_handler(&self, id: HandlerId) -> Result<()>;

    /// Only before `run`.
    fn add_indexers(&self, indexers: Indexers<K>) -> Result<()>;

    /// Only before `run`.
    fn set_watch_error_handler(&self, handler: WatchErrorHandler) -> Result<()>;

    /// Only before `run`.
    fn set_transform(&self, transform: TransformFn<K>) -> Result<()>;

    /// Blocks until `cancel` fires or `stop` is called.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    fn has_synced(&self) -> bool;

    fn is_stopped(&self) -> bool;

    fn last_sync_resource_version(&self) -> String;
}

struct Pending<L: ListWatcher> {
    lw: L,
    selector: Selector,
    writer: Writer<L::Object>,
    on_error: Option<WatchErrorHandler>,
    transform: Option<TransformFn<L::Object>>,
}

/// A store kept in sync with one remote collection, plus handler fan-out.
pub struct Informer<L: ListWatcher> {
    name: Arc<str>,
    store: Store<L::Object>,
    dispatcher: Arc<Dispatcher<L::Object>>,
    status: Arc<watch::Sender<SyncStatus>>,
    stop: CancellationToken,
    config: InformerConfig,
    pending: Mutex<Option<Pending<L>>>,
}

impl<L: ListWatcher> Informer<L> {
    pub fn new(
        name: &str,
        lw: L,
        selector: Selector,
        indexers: Indexers<L::Object>,
        config: InformerConfig,
    ) -> Self {
        let (writer, store) = tether_store::store(indexers);
        let stop = CancellationToken::new();
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            name: Arc::from(name),
            store,
            dispatcher: Arc::new(Dispatcher::new(name, stop.child_token())),
            status: Arc::new(status),
            stop,
            config,
            pending: Mutex::new(Some(Pending { lw, selector, writer, on_error: None, transform: None })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store<L::Object> {
        &self.store
    }

    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    /// Handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.dispatcher.len()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Abort in-flight list/watch calls and stop delivery.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// `true` once synced, `false` if the informer stopped first, including
    /// a `stop` that lands before `run` was ever called.
    pub async fn wait_for_sync(&self) -> bool {
        let mut rx = self.status.subscribe();
        loop {
            {
                let s = rx.borrow_and_update();
                if s.synced {
                    return true;
                }
                if s.phase == Phase::Stopped {
                    return false;
                }
            }
            if self.stop.is_cancelled() {
                return self.has_synced();
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.has_synced();
                    }
                }
                _ = self.stop.cancelled() => return self.has_synced(),
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<Pending<L>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_pending<T>(&self, f: impl FnOnce(&mut Pending<L>) -> Result<T>) -> Result<T> {
        match self.lock_pending().as_mut() {
            Some(p) => f(p),
            None => Err(Error::AlreadyStarted),
        }
    }
}

#[async_trait::async_trait]
impl<L: ListWatcher> SharedIndexInformer<L::Object> for Informer<L> {
    fn indexer(&self) -> &dyn Indexer<L::Object> {
        &self.store
    }

    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<L::Object>>) -> Result<HandlerId> {
        self.add_event_handler_with_resync(handler, self.config.resync)
    }

    fn add_event_handler_with_resync(
        &self,
        handler: Arc<dyn ResourceEventHandler<L::Object>>,
        resync: Duration,
    ) -> Result<HandlerId> {
        let store = &self.store;
        self.dispatcher.register(handler, resync, || store.list())
    }

    fn remove_event_handler(&self, id: HandlerId) -> Result<()> {
        self.dispatcher.deregister(id)
    }

    fn add_indexers(&self, indexers: Indexers<L::Object>) -> Result<()> {
        self.with_pending(|p| p.writer.add_indexers(indexers))
    }

    fn set_watch_error_handler(&self, handler: WatchErrorHandler) -> Result<()> {
        self.with_pending(|p| {
            p.on_error = Some(handler);
            Ok(())
        })
    }

    fn set_transform(&self, transform: TransformFn<L::Object>) -> Result<()> {
        self.with_pending(|p| {
            p.transform = Some(transform);
            Ok(())
        })
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let pending = self.lock_pending().take().ok_or(Error::AlreadyStarted)?;
        let on_error = pending.on_error.unwrap_or_else(|| {
            let name = Arc::clone(&self.name);
            let handler: WatchErrorHandler = Arc::new(move |e: &Error| default_watch_error_handler(&name, e));
            handler
        });
        let reflector = Reflector {
            name: Arc::clone(&self.name),
            lw: Arc::new(pending.lw),
            selector: pending.selector,
            writer: pending.writer,
            dispatcher: Arc::clone(&self.dispatcher),
            status: Arc::clone(&self.status),
            config: self.config.clone(),
            on_error,
            transform: pending.transform,
            cancel: self.stop.clone(),
        };
        let stop = self.stop.clone();
        let link = async move {
            tokio::select! {
                _ = cancel.cancelled() => stop.cancel(),
                _ = stop.cancelled() => {}
            }
        };
        tokio::join!(reflector.run(), link);
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.status.borrow().synced
    }

    fn is_stopped(&self) -> bool {
        self.status.borrow().phase == Phase::Stopped
    }

    fn last_sync_resource_version(&self) -> String {
        self.status.borrow().resource_version.clone()
    }
}
