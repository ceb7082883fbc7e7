//! Management access to Cassandra nodes.
//!
//! The reconciler talks to nodes through [`NodeControl`], one client per pod,
//! obtained from a [`NodeControlFactory`]. The production implementation is
//! [`JolokiaClient`], which speaks the Jolokia JSON protocol to the agent
//! running next to each Cassandra process.

mod credentials;
mod jolokia;

pub use credentials::{Credentials, CredentialsResolver, JolokiaFactory};
pub use jolokia::JolokiaClient;

use crate::crd::CassandraCluster;
use crate::error::OperatorResult;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::Arc;

/// Keyspaces local to each node, never cleaned up.
pub const LOCAL_SYSTEM_KEYSPACES: &[&str] = &["system", "system_schema"];

/// Operation mode of a node that is serving requests.
pub const OPERATION_MODE_NORMAL: &str = "NORMAL";
/// Operation mode of a node that left the ring.
pub const OPERATION_MODE_DECOMMISSIONED: &str = "DECOMMISSIONED";

/// Compaction task type of a cleanup.
pub const COMPACTION_CLEANUP: &str = "Cleanup";
/// Compaction task type of an upgradesstables.
pub const COMPACTION_UPGRADE_SSTABLES: &str = "Upgrade sstables";

/// Operations the operator runs against a single Cassandra node.
#[async_trait]
pub trait NodeControl: Send + Sync {
    /// Current StorageService operation mode (`NORMAL`, `LEAVING`, `DECOMMISSIONED`, ...).
    async fn operation_mode(&self) -> OperatorResult<String>;

    /// Start a decommission. Blocks on the node until it has left.
    async fn decommission(&self) -> OperatorResult<()>;

    /// Cleanup each keyspace.
    async fn cleanup(&self, keyspaces: &[String]) -> OperatorResult<()>;

    /// Rewrite the SSTables of each keyspace.
    async fn upgrade_sstables(&self, keyspaces: &[String], threads: i32) -> OperatorResult<()>;

    /// Stream data from another datacenter.
    async fn rebuild(&self, source_dc: &str) -> OperatorResult<()>;

    /// Remove a dead node from the ring.
    async fn remove_node(&self, host_id: &str) -> OperatorResult<()>;

    /// All keyspaces.
    async fn keyspaces(&self) -> OperatorResult<Vec<String>>;

    /// Node address to host id.
    async fn host_id_map(&self) -> OperatorResult<HashMap<String, String>>;

    /// Nodes currently leaving the ring.
    async fn leaving_nodes(&self) -> OperatorResult<Vec<String>>;

    /// Nodes currently joining the ring.
    async fn joining_nodes(&self) -> OperatorResult<Vec<String>>;

    /// Non-system keyspaces with token ranges replicated to `dc`.
    async fn has_data_in_dc(&self, dc: &str) -> OperatorResult<Vec<String>>;

    /// Whether a compaction of the given task type is running.
    async fn has_compactions_of_type(&self, task_type: &str) -> OperatorResult<bool>;

    /// Whether streaming sessions are active.
    async fn has_streaming_sessions(&self) -> OperatorResult<bool>;

    /// Keyspaces except the local system ones.
    async fn non_local_keyspaces(&self) -> OperatorResult<Vec<String>> {
        Ok(self
            .keyspaces()
            .await?
            .into_iter()
            .filter(|k| !LOCAL_SYSTEM_KEYSPACES.contains(&k.as_str()))
            .collect())
    }
}

/// Builds node clients for pods of a cluster.
#[async_trait]
pub trait NodeControlFactory: Send + Sync + 'static {
    /// Connect to the node running in `pod`.
    async fn connect(
        &self,
        cluster: &CassandraCluster,
        pod: &Pod,
    ) -> OperatorResult<Arc<dyn NodeControl>>;
}

/// Address of the node in `pod`: `<hostname>.<subdomain>`, else the pod IP.
pub fn pod_host(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref();
    match (
        spec.and_then(|s| s.hostname.as_deref()),
        spec.and_then(|s| s.subdomain.as_deref()),
    ) {
        (Some(host), Some(sub)) => Some(format!("{host}.{sub}")),
        _ => pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};

    #[test]
    fn pod_host_prefers_dns_name() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                hostname: Some("c-dc1-rack1-0".into()),
                subdomain: Some("c-dc1-rack1".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.1".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_host(&pod).as_deref(), Some("c-dc1-rack1-0.c-dc1-rack1"));

        pod.spec = None;
        assert_eq!(pod_host(&pod).as_deref(), Some("10.0.0.1"));
    }
}
