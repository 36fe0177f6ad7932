#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use tether_core::{DynObject, Error, ListResult, ListWatcher, Object, Result, Selector, WatchEvent, WatchStream};
use tether_informer::{CancellationToken, Informer, InformerConfig, ResourceEventHandler, SharedIndexInformer};
use tether_store::Indexers;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    Watch(String),
}

pub enum Script {
    /// Stream ends after these events.
    Close(Vec<WatchEvent<DynObject>>),
    /// Stream stays open after these events.
    Hang(Vec<WatchEvent<DynObject>>),
    /// Opening the watch fails.
    Fail(Error),
}

#[derive(Default)]
struct State {
    lists: VecDeque<Result<ListResult<DynObject>>>,
    watches: VecDeque<Script>,
    calls: Vec<Call>,
}

/// In-memory remote: answers list/watch calls from queued scripts. Once a
/// queue is empty, lists never complete and watches stay silently open.
#[derive(Clone, Default)]
pub struct ScriptedListWatcher {
    state: Arc<Mutex<State>>,
}

impl ScriptedListWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list_ok(self, rv: &str, items: Vec<DynObject>) -> Self {
        self.state.lock().unwrap().lists.push_back(Ok(ListResult { items, resource_version: rv.to_string() }));
        self
    }

    pub fn list_err(self, err: Error) -> Self {
        self.state.lock().unwrap().lists.push_back(Err(err));
        self
    }

    pub fn watch(self, script: Script) -> Self {
        self.state.lock().unwrap().watches.push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait::async_trait]
impl ListWatcher for ScriptedListWatcher {
    type Object = DynObject;

    async fn list(&self, _selector: &Selector) -> Result<ListResult<DynObject>> {
        let next = {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::List);
            s.lists.pop_front()
        };
        match next {
            Some(r) => r,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, _selector: &Selector, resource_version: &str) -> Result<WatchStream<DynObject>> {
        let next = {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::Watch(resource_version.to_string()));
            s.watches.pop_front()
        };
        match next {
            Some(Script::Close(evs)) => Ok(stream::iter(evs).boxed()),
            Some(Script::Hang(evs)) => Ok(stream::iter(evs).chain(stream::pending()).boxed()),
            Some(Script::Fail(e)) => Err(e),
            None => Ok(stream::pending().boxed()),
        }
    }
}

pub fn obj(ns: &str, name: &str, rv: &str) -> DynObject {
    DynObject::new(Some(ns), name, rv)
}

/// Records deliveries as "add A", "update A", "resync A", "delete A".
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        wait_until(|| self.seen.lock().unwrap().len() >= n).await;
        self.events()
    }

    fn push(&self, s: String) {
        self.seen.lock().unwrap().push(s);
    }
}

impl ResourceEventHandler<DynObject> for Recorder {
    fn on_add(&self, obj: &DynObject) -> anyhow::Result<()> {
        self.push(format!("add {}", obj.name()));
        Ok(())
    }

    fn on_update(&self, old: &DynObject, new: &DynObject) -> anyhow::Result<()> {
        let verb = if old == new { "resync" } else { "update" };
        self.push(format!("{} {}", verb, new.name()));
        Ok(())
    }

    fn on_delete(&self, obj: &DynObject) -> anyhow::Result<()> {
        self.push(format!("delete {}", obj.name()));
        Ok(())
    }
}

/// Poll `cond` for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within 5s");
}

pub fn fast_config() -> InformerConfig {
    InformerConfig::default()
        .with_resync(Duration::ZERO)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

pub fn informer(lw: ScriptedListWatcher, config: InformerConfig) -> Arc<Informer<ScriptedListWatcher>> {
    Arc::new(Informer::new("test", lw, Selector::all(), Indexers::namespaced(), config))
}

pub fn start(inf: &Arc<Informer<ScriptedListWatcher>>) -> (CancellationToken, JoinHandle<Result<()>>) {
    let token = CancellationToken::new();
    let inf = Arc::clone(inf);
    let cancel = token.clone();
    let handle = tokio::spawn(async move { inf.run(cancel).await });
    (token, handle)
}

pub async fn shutdown(token: CancellationToken, handle: JoinHandle<Result<()>>) {
    token.cancel();
    let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(matches!(joined, Ok(Ok(Ok(())))), "run did not return after cancel");
}
