use std::sync::Arc;

use anyhow::Result;
use tether_core::Error;

/// Consumer callbacks. Each registered handler runs on its own delivery task;
/// a returned error is logged and delivery continues.
pub trait ResourceEventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, _obj: &K) -> Result<()> {
        Ok(())
    }

    fn on_update(&self, _old: &K, _new: &K) -> Result<()> {
        Ok(())
    }

    fn on_delete(&self, _obj: &K) -> Result<()> {
        Ok(())
    }
}

type AddFn<K> = Box<dyn Fn(&K) -> Result<()> + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) -> Result<()> + Send + Sync>;

/// Closure-backed handler; unset callbacks do nothing.
pub struct HandlerFuncs<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFuncs<K> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<K> HandlerFuncs<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&K) -> Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&K, &K) -> Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&K) -> Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: Send + Sync + 'static> ResourceEventHandler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &K) -> Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &K, new: &K) -> Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &K) -> Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// Observability hook for terminal list/watch errors. Does not affect retries.
pub type WatchErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Applied to every object before it is stored.
pub type TransformFn<K> = Arc<dyn Fn(K) -> K + Send + Sync>;

pub(crate) fn default_watch_error_handler(informer: &str, err: &Error) {
    match err {
        Error::Expired(msg) => tracing::info!(informer = %informer, reason = %msg, "watch resume point expired; relisting"),
        other => tracing::warn!(informer = %informer, error = %other, "list/watch failed"),
    }
}
