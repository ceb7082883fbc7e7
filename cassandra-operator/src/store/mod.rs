//! Object store abstraction over the Kubernetes API.
//!
//! The controller only needs namespaced get/create/update/delete/list with
//! resourceVersion optimistic concurrency. [`KubeStore`] provides it on top of
//! `kube::Api`; tests use [`crate::testing::MemoryStore`].

mod kube_store;

pub use kube_store::KubeStore;

use crate::error::OperatorResult;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// A namespaced Kubernetes kind the store can handle.
pub trait StoreObject:
    kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Key-value store of Kubernetes objects keyed by (namespace, name).
///
/// Errors are classified with [`crate::OperatorError::is_not_found`],
/// [`crate::OperatorError::is_already_exists`] and
/// [`crate::OperatorError::is_conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object.
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> OperatorResult<K>;

    /// Create an object.
    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K>;

    /// Replace an object. Fails with a conflict when its resourceVersion is stale.
    async fn update<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K>;

    /// Replace the status subresource, with the same concurrency rule as `update`.
    async fn update_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> OperatorResult<K>;

    /// Delete an object, optionally with a grace period in seconds.
    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Option<u32>,
    ) -> OperatorResult<()>;

    /// List objects carrying every label of `selector`.
    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> OperatorResult<Vec<K>>;
}

/// Render a label selector as `k1=v1,k2=v2`.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` carries every pair of `selector`.
pub fn labels_match(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_rendering_and_matching() {
        let selector: BTreeMap<String, String> = [
            ("app".to_string(), "cassandracluster".to_string()),
            ("dc-rack".to_string(), "dc1-rack1".to_string()),
        ]
        .into();
        assert_eq!(
            selector_string(&selector),
            "app=cassandracluster,dc-rack=dc1-rack1"
        );

        let mut labels = selector.clone();
        labels.insert("other".into(), "x".into());
        assert!(labels_match(Some(&labels), &selector));
        labels.remove("dc-rack");
        assert!(!labels_match(Some(&labels), &selector));
        assert!(labels_match(None, &BTreeMap::new()));
    }
}
