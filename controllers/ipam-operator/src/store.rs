//! Kubernetes-backed `IPAMNode` store.
//!
//! Spec writes replace the whole object, status writes send a JSON merge
//! patch that carries `metadata.resourceVersion` so a stale base version is
//! rejected by the API server with 409.

use crds::IPAMNode;
use ipam::{NodeStore, StoreError};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value, json};
use tracing::debug;

/// `NodeStore` backed by the cluster-scoped `IPAMNode` API
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<IPAMNode>,
}

impl std::fmt::Debug for KubeNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeStore").finish_non_exhaustive()
    }
}

impl KubeNodeStore {
    /// Creates a store over all `IPAMNode` resources
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &str) -> Result<IPAMNode, StoreError> {
        self.api.get(name).await.map_err(|e| store_error(name, e))
    }

    async fn update(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError> {
        if orig.spec == node.spec {
            return Ok(None);
        }
        let name = node.name_any();
        debug!(node = %name, "Updating IPAMNode spec");
        self.api
            .replace(&name, &PostParams::default(), node)
            .await
            .map(Some)
            .map_err(|e| store_error(&name, e))
    }

    async fn update_status(&self, orig: &IPAMNode, node: &IPAMNode) -> Result<Option<IPAMNode>, StoreError> {
        if orig.status == node.status {
            return Ok(None);
        }
        let name = node.name_any();
        let patch = status_patch(orig, node).map_err(|e| StoreError::Api(format!("{name}: {e}")))?;
        debug!(node = %name, "Updating IPAMNode status");
        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(Some)
            .map_err(|e| store_error(&name, e))
    }
}

fn store_error(name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(name.to_string()),
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(name.to_string()),
        other => StoreError::Api(format!("{name}: {other}")),
    }
}

/// Merge patch turning the status of `orig` into the status of `node`,
/// pinned to the resource version of `node`.
fn status_patch(orig: &IPAMNode, node: &IPAMNode) -> Result<Value, serde_json::Error> {
    let from = serde_json::to_value(&orig.status)?;
    let to = serde_json::to_value(&node.status)?;
    Ok(json!({
        "metadata": { "resourceVersion": node.resource_version() },
        "status": merge_diff(&from, &to),
    }))
}

/// RFC 7386 merge patch from `from` to `to`. Keys that disappear become
/// `null`, which is how a merge patch deletes map entries.
fn merge_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for key in from.keys().filter(|key| !to.contains_key(*key)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, value) in to {
                match from.get(key) {
                    Some(old) if old == value => {}
                    Some(old) => {
                        patch.insert(key.clone(), merge_diff(old, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}
