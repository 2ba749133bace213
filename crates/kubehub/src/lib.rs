//! Rekon kubehub: discovery, client setup and a [`ResourceStore`] backed by
//! the Kubernetes list/watch API for one group/version/kind.

#![forbid(unsafe_code)]

use std::future::Future;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use rekon_core::{ChangeKind, Resource, ResourceList, ResourceStore, StoreError, WatchEvent, WatchStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Server-side watch timeout; the cache relists when the stream closes.
const WATCH_TIMEOUT_SECS: u32 = 290;
const WATCH_BUFFER: usize = 256;

/// Build a client from an explicit kubeconfig file, or the default chain
/// (in-cluster, `KUBECONFIG`, `~/.kube/config`).
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            Ok(Client::try_from(cfg)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
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

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a dynamic object into a cache resource. `managedFields` is dropped
/// from the raw copy.
pub fn resource_from(obj: &DynamicObject) -> Result<Resource, serde_json::Error> {
    let meta = &obj.metadata;
    let mut raw = serde_json::to_value(obj)?;
    strip_managed_fields(&mut raw);
    let mut r = Resource::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default()).with_raw(raw);
    r.uid = meta.uid.clone();
    r.resource_version = meta.resource_version.clone().unwrap_or_default();
    r.labels = meta.labels.iter().flatten().map(|(k, v)| (k.clone(), v.clone())).collect();
    Ok(r)
}

fn expired_or_transient(resp: &ErrorResponse) -> StoreError {
    if resp.code == 410 {
        StoreError::Expired(resp.message.clone())
    } else {
        StoreError::Transient(format!("{} ({}): {}", resp.reason, resp.code, resp.message))
    }
}

fn store_error(e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(resp) => expired_or_transient(resp),
        _ => StoreError::Transient(e.to_string()),
    }
}

/// Map one watch frame. Bookmarks carry no change and yield `None`.
fn convert_event(ev: kube::core::WatchEvent<DynamicObject>) -> Option<Result<WatchEvent, StoreError>> {
    let (kind, obj) = match ev {
        kube::core::WatchEvent::Added(o) => (ChangeKind::Added, o),
        kube::core::WatchEvent::Modified(o) => (ChangeKind::Updated, o),
        kube::core::WatchEvent::Deleted(o) => (ChangeKind::Deleted, o),
        kube::core::WatchEvent::Bookmark(_) => return None,
        kube::core::WatchEvent::Error(resp) => return Some(Err(expired_or_transient(&resp))),
    };
    Some(
        resource_from(&obj)
            .map(|resource| WatchEvent { kind, resource })
            .map_err(|e| StoreError::Transient(format!("decoding watch object: {}", e))),
    )
}

/// Store over one GVK, optionally scoped to a namespace.
#[derive(Clone)]
pub struct KubeStore {
    api: Api<DynamicObject>,
    gvk: String,
}

impl KubeStore {
    /// Resolve `gvk_key` through discovery and bind an API handle for it.
    /// `namespace` is ignored for cluster-scoped kinds.
    pub async fn connect(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube store bound");
        Ok(Self { api, gvk: gvk_key.to_string() })
    }
}

type Frames = mpsc::Sender<Result<WatchEvent, StoreError>>;

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `forward` on its own task and expose what it sends as a stream. The
/// stream owns the task: dropping it aborts the forwarder.
fn forwarded<F, Fut>(forward: F) -> WatchStream
where
    F: FnOnce(Frames) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let task = AbortOnDrop(tokio::spawn(forward(tx)));
    futures::stream::unfold((rx, task), |(mut rx, task)| async move { rx.recv().await.map(|item| (item, (rx, task))) })
        .boxed()
}

async fn forward_watch(api: Api<DynamicObject>, since: String, tx: Frames) {
    let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    let opened = tokio::select! {
        _ = tx.closed() => return,
        r = api.watch(&wp, &since) => r,
    };
    let stream = match opened {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.send(Err(store_error(e))).await;
            return;
        }
    };
    futures::pin_mut!(stream);
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return,
            n = stream.next() => n,
        };
        let Some(frame) = next else { return };
        let out = match frame {
            Ok(ev) => match convert_event(ev) {
                Some(out) => out,
                None => continue,
            },
            Err(e) => Err(store_error(e)),
        };
        let fatal = out.is_err();
        if tx.send(out).await.is_err() || fatal {
            return;
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn list(&self) -> Result<ResourceList, StoreError> {
        let list = self.api.list(&ListParams::default()).await.map_err(store_error)?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            items.push(resource_from(obj).map_err(|e| StoreError::Transient(format!("decoding list item: {}", e)))?);
        }
        debug!(gvk = %self.gvk, count = items.len(), "listed");
        Ok(ResourceList { resource_version: list.metadata.resource_version.unwrap_or_default(), items })
    }

    async fn watch(&self, since_version: &str) -> Result<WatchStream, StoreError> {
        counter!("kube_watch_opened_total", 1u64, "gvk" => self.gvk.clone());
        let api = self.api.clone();
        let since = since_version.to_string();
        Ok(forwarded(move |tx| forward_watch(api, since, tx)))
    }
}
