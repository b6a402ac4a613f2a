//! Reconq kubehub: GVK resolution and a watch source backed by the kube watcher.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use reconq_core::{Object, ObjectMeta, WatchEvent};
use tracing::{debug, info};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Convert a watched object into the queue's resource snapshot.
pub fn object_from(obj: &DynamicObject, kind: &str) -> Result<Object> {
    let meta = &obj.metadata;
    let uid = meta.uid.clone().ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let field = |name: &str| obj.data.get(name).cloned().unwrap_or(serde_json::Value::Null);
    Ok(Object {
        kind: obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_else(|| kind.to_string()),
        metadata: ObjectMeta {
            uid,
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            resource_version: meta.resource_version.clone(),
            generation: meta.generation,
            deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        },
        spec: field("spec"),
        status: field("status"),
    })
}

fn events_from(ev: Event<DynamicObject>, kind: &str) -> Vec<Result<WatchEvent<Object>>> {
    match ev {
        Event::Applied(o) => vec![object_from(&o, kind).map(WatchEvent::modified)],
        Event::Deleted(o) => vec![object_from(&o, kind).map(WatchEvent::deleted)],
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            list.iter().map(|o| object_from(o, kind).map(WatchEvent::added)).collect()
        }
    }
}

/// List+watch a GVK (optionally in one namespace) as a stream of raw notifications.
///
/// Watch errors are retried with the watcher's default backoff and surface as `Err` items.
pub async fn watch(gvk_key: &str, namespace: Option<&str>) -> Result<BoxStream<'static, Result<WatchEvent<Object>>>> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };

    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    let kind = ar.kind.clone();
    let stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .flat_map(move |res| {
            let items = match res {
                Ok(ev) => events_from(ev, &kind),
                Err(e) => vec![Err(anyhow::Error::from(e))],
            };
            futures::stream::iter(items)
        })
        .boxed();
    Ok(stream)
}
