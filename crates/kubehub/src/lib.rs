//! Tether kubehub: resource discovery and a kube-backed list/watch source.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod listwatch;

pub use listwatch::{to_dyn_object, KubeListWatcher, DEFAULT_WATCH_TIMEOUT_SECS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served resources (CRDs included), preferred version per group, sorted.
pub async fn discover(client: Client) -> Result<Vec<ResourceDescriptor>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(ResourceDescriptor {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    debug!(resources = out.len(), "discovery complete");
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK against the cluster; the flag is `true` for namespaced kinds.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_parse_for_core_and_named_groups() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.kind, "Deployment");
        assert!(parse_gvk_key("Deployment").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn descriptor_key_round_trips_through_parse() {
        let d = ResourceDescriptor {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
            plural: "deployments".into(),
            namespaced: true,
        };
        let gvk = parse_gvk_key(&d.gvk_key()).unwrap();
        assert_eq!(gvk, GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let core = ResourceDescriptor { group: String::new(), ..d };
        assert_eq!(core.gvk_key(), "v1/Deployment");
    }
}
