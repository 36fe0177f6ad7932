//! `ListWatcher` over `Api<DynamicObject>`.

use anyhow::Context;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    Client,
};
use tether_core::{DynObject, Error, ListResult, ListWatcher, Result, Selector, WatchEvent, WatchStream};
use tracing::{debug, warn};

use crate::{find_api_resource, parse_gvk_key};

/// Server-side watch timeout; the API server rejects values of 295s and up.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;
const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

fn watch_timeout_from(lookup: impl Fn(&str) -> Option<String>) -> u32 {
    lookup("TETHER_WATCH_TIMEOUT_SECS")
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|&s| s > 0)
        .unwrap_or(DEFAULT_WATCH_TIMEOUT_SECS)
        .min(MAX_WATCH_TIMEOUT_SECS)
}

pub struct KubeListWatcher {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
    watch_timeout: u32,
}

impl KubeListWatcher {
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self {
            client,
            resource,
            namespaced,
            watch_timeout: watch_timeout_from(|k| std::env::var(k).ok()),
        }
    }

    /// Resolve `v1/Kind` or `group/v1/Kind` through discovery.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> anyhow::Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk)
            .await
            .with_context(|| format!("resolving {}", gvk_key))?;
        Ok(Self::new(client, resource, namespaced))
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn api(&self, selector: &Selector) -> Api<DynamicObject> {
        match selector.namespace.as_deref() {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(f) = &selector.field_selector {
        lp = lp.fields(f);
    }
    if let Some(l) = &selector.label_selector {
        lp = lp.labels(l);
    }
    lp
}

fn watch_params(selector: &Selector, timeout: u32) -> WatchParams {
    let mut wp = WatchParams::default().timeout(timeout);
    if let Some(f) = &selector.field_selector {
        wp = wp.fields(f);
    }
    if let Some(l) = &selector.label_selector {
        wp = wp.labels(l);
    }
    wp
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Lift identity, version and labels out of a served object. The raw payload
/// keeps everything except `metadata.managedFields`.
pub fn to_dyn_object(obj: DynamicObject) -> Result<DynObject> {
    let name = match obj.metadata.name.as_deref() {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => return Err(Error::Malformed("object missing metadata.name".into())),
    };
    let mut raw = serde_json::to_value(&obj).map_err(|e| Error::Malformed(format!("{}: {}", name, e)))?;
    strip_managed_fields(&mut raw);
    let meta = obj.metadata;
    let mut out = DynObject::new(meta.namespace.as_deref(), &name, "").with_raw(raw);
    out.resource_version = meta.resource_version.filter(|rv| !rv.is_empty());
    out.uid = meta.uid;
    for (k, v) in meta.labels.unwrap_or_default() {
        out = out.with_label(&k, &v);
    }
    Ok(out)
}

fn status_error(status: ErrorResponse) -> Error {
    if status.code == 410 {
        Error::Expired(status.message)
    } else {
        Error::Transport(format!("{} ({}): {}", status.reason, status.code, status.message))
    }
}

fn kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(status) => status_error(status),
        other => Error::Transport(other.to_string()),
    }
}

fn watch_event(ev: kube::core::WatchEvent<DynamicObject>) -> WatchEvent<DynObject> {
    let lift = |o: DynamicObject, f: fn(DynObject) -> WatchEvent<DynObject>| match to_dyn_object(o) {
        Ok(d) => f(d),
        Err(e) => WatchEvent::Error(e),
    };
    match ev {
        kube::core::WatchEvent::Added(o) => lift(o, WatchEvent::Added),
        kube::core::WatchEvent::Modified(o) => lift(o, WatchEvent::Modified),
        kube::core::WatchEvent::Deleted(o) => lift(o, WatchEvent::Deleted),
        kube::core::WatchEvent::Bookmark(b) => WatchEvent::Bookmark(b.metadata.resource_version),
        kube::core::WatchEvent::Error(status) => WatchEvent::Error(status_error(status)),
    }
}

#[async_trait::async_trait]
impl ListWatcher for KubeListWatcher {
    type Object = DynObject;

    async fn list(&self, selector: &Selector) -> Result<ListResult<DynObject>> {
        let list = self.api(selector).list(&list_params(selector)).await.map_err(kube_error)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for o in list.items {
            match to_dyn_object(o) {
                Ok(d) => items.push(d),
                Err(e) => warn!(kind = %self.resource.kind, error = %e, "skipping undecodable list item"),
            }
        }
        debug!(kind = %self.resource.kind, items = items.len(), rv = %resource_version, "listed");
        Ok(ListResult { items, resource_version })
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream<DynObject>> {
        let wp = watch_params(selector, self.watch_timeout);
        let stream = self.api(selector).watch(&wp, resource_version).await.map_err(kube_error)?;
        Ok(stream
            .map(|r| match r {
                Ok(ev) => watch_event(ev),
                Err(e) => WatchEvent::Error(kube_error(e)),
            })
            .boxed())
    }
}
