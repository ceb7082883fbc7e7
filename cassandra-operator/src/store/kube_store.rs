//! [`ObjectStore`] backed by the Kubernetes API server.

use super::{ObjectStore, StoreObject, selector_string};
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;

/// Object store over a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store on top of a client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn classify<K: StoreObject>(err: kube::Error, namespace: &str, name: &str) -> OperatorError {
    let kind = K::kind(&()).to_string();
    match err {
        kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            OperatorError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict {
            kind,
            name: name.to_string(),
        },
        other => OperatorError::KubeError(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> OperatorResult<K> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| classify::<K>(e, namespace, name))
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let name = obj.name_any();
        tracing::debug!(kind = %K::kind(&()), name = %name, "Creating object");
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, namespace, &name))
    }

    async fn update<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, namespace, &name))
    }

    async fn update_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K> {
        let name = obj.name_any();
        let value = serde_json::to_value(obj)?;
        // resourceVersion in a merge patch makes the write conditional.
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        self.api::<K>(namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(e, namespace, &name))
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Option<u32>,
    ) -> OperatorResult<()> {
        let params = DeleteParams {
            grace_period_seconds: grace_period,
            ..Default::default()
        };
        self.api::<K>(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| classify::<K>(e, namespace, name))
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<K>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| classify::<K>(e, namespace, ""))?;
        Ok(list.items)
    }
}
