//! The list/watch loop: list, seed the store, watch from the returned token,
//! and start over when the token expires or watching keeps failing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use tether_core::{Error, ListResult, ListWatcher, Object, Selector, WatchEvent, WatchStream};
use tether_store::{Indexer, Writer};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InformerConfig;
use crate::dispatcher::Dispatcher;
use crate::handler::{TransformFn, WatchErrorHandler};
use crate::{Phase, SyncStatus};

/// Floor for the resync evaluation tick.
const MIN_RESYNC_CHECK: Duration = Duration::from_millis(10);

/// How one watch attempt ended. `progressed` is set when anything arrived first.
enum StreamEnd {
    Cancelled,
    Expired,
    /// The remote closed the stream cleanly, e.g. on its server-side timeout.
    Closed { progressed: bool },
    /// Opening failed or a non-skippable error arrived.
    Failed { progressed: bool },
}

pub(crate) struct Reflector<L: ListWatcher> {
    pub(crate) name: Arc<str>,
    pub(crate) lw: Arc<L>,
    pub(crate) selector: Selector,
    pub(crate) writer: Writer<L::Object>,
    pub(crate) dispatcher: Arc<Dispatcher<L::Object>>,
    pub(crate) status: Arc<watch::Sender<SyncStatus>>,
    pub(crate) config: InformerConfig,
    pub(crate) on_error: WatchErrorHandler,
    pub(crate) transform: Option<TransformFn<L::Object>>,
    pub(crate) cancel: CancellationToken,
}

struct Running<L: ListWatcher> {
    r: Reflector<L>,
    resync: Interval,
    backoff: ExponentialBackoff,
}

impl<L: ListWatcher> Reflector<L> {
    pub(crate) async fn run(self) {
        let mut resync = tokio::time::interval(self.config.resync_check.max(MIN_RESYNC_CHECK));
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let backoff = self.config.watch_backoff();
        info!(informer = %self.name, selector = %self.selector, "reflector starting");
        let mut running = Running { r: self, resync, backoff };
        running.sync_loop().await;
        running.r.finish();
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_if_modified(|s| {
            let changed = s.phase != phase;
            s.phase = phase;
            changed
        });
        debug!(informer = %self.name, ?phase, "reflector phase");
    }

    fn report(&self, err: &Error) {
        (self.on_error)(err);
    }

    fn label(&self) -> String {
        self.name.to_string()
    }

    fn finish(&self) {
        self.set_phase(Phase::Stopped);
        self.dispatcher.shutdown();
        info!(informer = %self.name, "reflector stopped");
    }

    fn resync_tick(&self) {
        let writer = &self.writer;
        let handlers = self.dispatcher.resync_due(Instant::now(), || writer.resync());
        if handlers > 0 {
            counter!("tether_resync_total", 1u64, "informer" => self.label());
        }
    }

    fn transformed(&self, obj: L::Object) -> L::Object {
        match &self.transform {
            Some(t) => t(obj),
            None => obj,
        }
    }

    /// Store a listed snapshot and emit the reconciling deltas.
    fn sync(&mut self, list: ListResult<L::Object>) -> String {
        self.set_phase(Phase::Syncing);
        let ListResult { items, resource_version } = list;
        let items: Vec<_> = items.into_iter().map(|o| self.transformed(o)).collect();
        let count = items.len();
        let writer = &mut self.writer;
        let changes = self.dispatcher.commit(|| writer.replace(items));
        self.record_objects();
        self.status.send_modify(|s| {
            s.synced = true;
            s.resource_version = resource_version.clone();
        });
        info!(informer = %self.name, items = count, changes, rv = %resource_version, "list synced");
        resource_version
    }

    /// Apply one watched object and advance the token from it.
    fn apply(&mut self, obj: L::Object, deleted: bool, rv: &mut String) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(v) = obj.resource_version().filter(|v| !v.is_empty()) {
            v.clone_into(rv);
        }
        let obj = self.transformed(obj);
        let writer = &mut self.writer;
        self.dispatcher.commit(move || {
            if deleted {
                writer.remove(&obj).into_iter().collect()
            } else {
                vec![writer.upsert(obj)]
            }
        });
        self.record_objects();
        self.record_rv(rv);
    }

    fn record_objects(&self) {
        let objects = self.writer.store().len();
        gauge!("tether_store_objects", objects as f64, "informer" => self.label());
        self.status.send_if_modified(|s| {
            let changed = s.objects != objects;
            s.objects = objects;
            changed
        });
    }

    fn record_rv(&self, rv: &str) {
        self.status.send_if_modified(|s| {
            if s.resource_version == rv {
                return false;
            }
            rv.clone_into(&mut s.resource_version);
            true
        });
    }
}

impl<L: ListWatcher> Running<L> {
    /// Await `fut` while serving resync ticks; `None` once cancelled.
    async fn until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.r.cancel.cancelled() => return None,
                _ = self.resync.tick() => self.r.resync_tick(),
                out = &mut fut => return Some(out),
            }
        }
    }

    fn next_delay(&mut self) -> Duration {
        self.backoff.next_backoff().unwrap_or(self.backoff.max_interval)
    }

    async fn pause(&mut self, delay: Duration) -> bool {
        self.until(tokio::time::sleep(delay)).await.is_some()
    }

    async fn sync_loop(&mut self) {
        'list: loop {
            let Some(mut rv) = self.list().await else { return };
            let mut failures = 0u32;
            loop {
                self.r.set_phase(Phase::Watching);
                let lw = Arc::clone(&self.r.lw);
                let selector = self.r.selector.clone();
                let from = rv.clone();
                let Some(opened) = self.until(async move { lw.watch(&selector, &from).await }).await else {
                    return;
                };
                let end = match opened {
                    Ok(stream) => {
                        counter!("tether_watch_restarts_total", 1u64, "informer" => self.r.label());
                        debug!(informer = %self.r.name, rv = %rv, "watch opened");
                        self.consume(stream, &mut rv).await
                    }
                    Err(e) => {
                        self.r.report(&e);
                        if e.is_expired() {
                            StreamEnd::Expired
                        } else {
                            StreamEnd::Failed { progressed: false }
                        }
                    }
                };
                match end {
                    StreamEnd::Cancelled => return,
                    StreamEnd::Expired => {
                        counter!("tether_relist_expired_total", 1u64, "informer" => self.r.label());
                        continue 'list;
                    }
                    StreamEnd::Closed { progressed } => {
                        if progressed {
                            self.backoff.reset();
                        }
                        failures = 0;
                    }
                    StreamEnd::Failed { progressed } => {
                        if progressed {
                            self.backoff.reset();
                            failures = 0;
                        }
                        failures += 1;
                    }
                }
                if failures > 0 && failures >= self.r.config.max_watch_retries {
                    warn!(informer = %self.r.name, failures, "watch keeps failing; falling back to list");
                    continue 'list;
                }
                let delay = self.next_delay();
                debug!(informer = %self.r.name, delay_ms = delay.as_millis() as u64, "reopening watch after backoff");
                if !self.pause(delay).await {
                    return;
                }
            }
        }
    }

    /// List until it succeeds; returns the resume token, or `None` once cancelled.
    async fn list(&mut self) -> Option<String> {
        loop {
            self.r.set_phase(Phase::Listing);
            let lw = Arc::clone(&self.r.lw);
            let selector = self.r.selector.clone();
            let started = std::time::Instant::now();
            let res = self.until(async move { lw.list(&selector).await }).await?;
            counter!("tether_list_total", 1u64, "informer" => self.r.label());
            match res {
                Ok(list) => {
                    histogram!("tether_list_ms", started.elapsed().as_secs_f64() * 1000.0, "informer" => self.r.label());
                    if self.r.cancel.is_cancelled() {
                        return None;
                    }
                    self.backoff.reset();
                    return Some(self.r.sync(list));
                }
                Err(e) => {
                    counter!("tether_list_errors_total", 1u64, "informer" => self.r.label());
                    self.r.report(&e);
                    let delay = self.next_delay();
                    if !self.pause(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn consume(&mut self, mut stream: WatchStream<L::Object>, rv: &mut String) -> StreamEnd {
        let mut progressed = false;
        loop {
            let Some(next) = self.until(stream.next()).await else { return StreamEnd::Cancelled };
            let Some(event) = next else {
                debug!(informer = %self.r.name, progressed, "watch closed by remote");
                return StreamEnd::Closed { progressed };
            };
            let kind = match &event {
                WatchEvent::Added(_) => "added",
                WatchEvent::Modified(_) => "modified",
                WatchEvent::Deleted(_) => "deleted",
                WatchEvent::Bookmark(_) => "bookmark",
                WatchEvent::Error(_) => "error",
            };
            counter!("tether_watch_events_total", 1u64, "informer" => self.r.label(), "type" => kind);
            match event {
                WatchEvent::Added(o) | WatchEvent::Modified(o) => self.r.apply(o, false, rv),
                WatchEvent::Deleted(o) => self.r.apply(o, true, rv),
                WatchEvent::Bookmark(v) => {
                    if !v.is_empty() {
                        *rv = v;
                        self.r.record_rv(rv);
                    }
                }
                WatchEvent::Error(e) => {
                    self.r.report(&e);
                    if e.is_expired() {
                        return StreamEnd::Expired;
                    }
                    if !e.is_skippable() {
                        return StreamEnd::Failed { progressed };
                    }
                    continue;
                }
            }
            progressed = true;
        }
    }
}
