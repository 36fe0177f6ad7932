//! Fan-out of store deltas to registered handlers.
//!
//! Each handler owns an unbounded FIFO queue drained by its own task, so a
//! slow handler only delays itself. Store writes and enqueueing happen under
//! one lock; a handler registered mid-stream sees every object exactly once.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_core::{Delta, Error, Object, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::ResourceEventHandler;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Listener<K> {
    tx: mpsc::UnboundedSender<Delta<K>>,
    token: CancellationToken,
    resync: Duration,
    next_resync: Option<Instant>,
}

pub struct Dispatcher<K> {
    informer: Arc<str>,
    listeners: Mutex<BTreeMap<HandlerId, Listener<K>>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl<K: Object> Dispatcher<K> {
    pub fn new(informer: &str, cancel: CancellationToken) -> Self {
        Self {
            informer: Arc::from(informer),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<HandlerId, Listener<K>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. `existing` is read under the dispatch lock and
    /// delivered as `Added` before anything else. A zero `resync` opts out of
    /// resync notifications.
    pub fn register(
        &self,
        handler: Arc<dyn ResourceEventHandler<K>>,
        resync: Duration,
        existing: impl FnOnce() -> Vec<Arc<K>>,
    ) -> Result<HandlerId> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }
        let rt = tokio::runtime::Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.cancel.child_token();

        let mut listeners = self.lock();
        let initial = existing();
        let initial_len = initial.len();
        for obj in initial {
            let _ = tx.send(Delta::Added(obj));
        }
        let next_resync = (!resync.is_zero()).then(|| Instant::now() + resync);
        listeners.insert(id, Listener { tx, token: token.clone(), resync, next_resync });
        drop(listeners);

        rt.spawn(deliver(Arc::clone(&self.informer), id, handler, rx, token));
        debug!(informer = %self.informer, handler = %id, initial = initial_len, resync_secs = resync.as_secs(), "handler registered");
        Ok(id)
    }

    pub fn deregister(&self, id: HandlerId) -> Result<()> {
        let listener = self.lock().remove(&id).ok_or(Error::UnknownHandler(id.0))?;
        listener.token.cancel();
        debug!(informer = %self.informer, handler = %id, "handler removed");
        Ok(())
    }

    /// Run a store mutation and enqueue the deltas it yields to every handler.
    pub(crate) fn commit(&self, mutate: impl FnOnce() -> Vec<Delta<K>>) -> usize {
        let mut listeners = self.lock();
        let deltas = mutate();
        if deltas.is_empty() || self.cancel.is_cancelled() {
            return deltas.len();
        }
        let mut dead = Vec::new();
        for (id, l) in listeners.iter() {
            if deltas.iter().any(|d| l.tx.send(d.clone()).is_err()) {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!(informer = %self.informer, handler = %id, "handler task gone; dropping registration");
            listeners.remove(&id);
        }
        deltas.len()
    }

    /// Deliver resync deltas to handlers whose period has elapsed. `snapshot`
    /// is only called when at least one handler is due.
    pub(crate) fn resync_due(&self, now: Instant, snapshot: impl FnOnce() -> Vec<Delta<K>>) -> usize {
        let mut listeners = self.lock();
        let due: Vec<HandlerId> = listeners
            .iter()
            .filter(|(_, l)| l.next_resync.is_some_and(|t| t <= now))
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() || self.cancel.is_cancelled() {
            return 0;
        }
        let deltas = snapshot();
        for id in &due {
            if let Some(l) = listeners.get_mut(id) {
                for d in &deltas {
                    let _ = l.tx.send(d.clone());
                }
                l.next_resync = Some(now + l.resync);
            }
        }
        debug!(informer = %self.informer, handlers = due.len(), objects = deltas.len(), "resync delivered");
        due.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Stop all delivery tasks; queued deltas are discarded.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.lock().clear();
    }
}

async fn deliver<K: Object>(
    informer: Arc<str>,
    id: HandlerId,
    handler: Arc<dyn ResourceEventHandler<K>>,
    mut rx: mpsc::UnboundedReceiver<Delta<K>>,
    token: CancellationToken,
) {
    loop {
        let delta = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(d) => d,
                None => break,
            },
        };
        let res = catch_unwind(AssertUnwindSafe(|| match &delta {
            Delta::Added(o) => handler.on_add(o),
            Delta::Updated { old, new } => handler.on_update(old, new),
            Delta::Deleted(o) => handler.on_delete(o),
        }));
        let failure = match res {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        warn!(informer = %informer, handler = %id, key = %delta.key(), error = %failure, "handler failed");
        metrics::counter!("tether_handler_errors_total", 1u64, "informer" => informer.to_string());
    }
    debug!(informer = %informer, handler = %id, "delivery stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
