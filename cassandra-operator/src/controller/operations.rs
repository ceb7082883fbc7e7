//! Per-pod operations triggered through pod labels.
//!
//! Each [`PodOperationKind`] knows how to start itself on a node, how to tell
//! whether the node is still busy with it, and what to clean up afterwards.

use crate::config::OperatorConfig;
use crate::crd::{CassandraCluster, OperationName};
use crate::error::{OperatorError, OperatorResult};
use crate::node_control::{COMPACTION_CLEANUP, COMPACTION_UPGRADE_SSTABLES, NodeControl};
use crate::resources::{LABEL_OPERATION_ARGUMENT, pod_label, pvc_name};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use std::net::IpAddr;
use std::time::Instant;

/// Operation a pod can be labelled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodOperationKind {
    /// `nodetool cleanup` on the non-system keyspaces.
    Cleanup,
    /// `nodetool upgradesstables` on every keyspace.
    UpgradeSSTables,
    /// `nodetool rebuild` from the DC named in `operation-argument`.
    Rebuild,
    /// `nodetool removenode` of the node named in `operation-argument`.
    Remove,
}

impl PodOperationKind {
    /// Every kind, in a fixed order.
    pub const ALL: [Self; 4] = [
        PodOperationKind::Cleanup,
        PodOperationKind::UpgradeSSTables,
        PodOperationKind::Rebuild,
        PodOperationKind::Remove,
    ];

    /// Name used in labels and in the rack status.
    pub fn name(self) -> OperationName {
        match self {
            PodOperationKind::Cleanup => OperationName::Cleanup,
            PodOperationKind::UpgradeSSTables => OperationName::UpgradeSSTables,
            PodOperationKind::Rebuild => OperationName::Rebuild,
            PodOperationKind::Remove => OperationName::Remove,
        }
    }

    /// Start the operation on the node of `pod`.
    pub async fn execute<S: ObjectStore>(
        self,
        store: &S,
        cc: &CassandraCluster,
        pod: &Pod,
        node: &dyn NodeControl,
    ) -> OperatorResult<()> {
        tracing::info!(
            cluster = %cc.name_any(),
            pod = %pod.name_any(),
            operation = %self.name(),
            "Operation start"
        );
        match self {
            PodOperationKind::Cleanup => {
                let keyspaces = node.non_local_keyspaces().await?;
                node.cleanup(&keyspaces).await
            }
            PodOperationKind::UpgradeSSTables => {
                let keyspaces = node.keyspaces().await?;
                node.upgrade_sstables(&keyspaces, 0).await
            }
            PodOperationKind::Rebuild => {
                let source = pod_label(pod, LABEL_OPERATION_ARGUMENT).ok_or_else(|| {
                    OperatorError::ValidationError(
                        "operation-argument must name the datacenter to rebuild from".into(),
                    )
                })?;
                if !cc.is_valid_dc(source) {
                    return Err(OperatorError::ValidationError(format!(
                        "{source} is not an existing datacenter"
                    )));
                }
                node.rebuild(source).await
            }
            PodOperationKind::Remove => {
                let target = RemoveTarget::from_pod(pod)?;
                let ip = match target.ip {
                    Some(ip) => ip.to_string(),
                    None => target.ip_from_pod(store, cc).await?,
                };
                let host_ids = node.host_id_map().await?;
                let host_id = host_ids.get(&ip).ok_or_else(|| {
                    OperatorError::NodeControl(format!("host with IP '{ip}' not found in the host id map"))
                })?;
                tracing::info!(
                    cluster = %cc.name_any(),
                    pod = %pod.name_any(),
                    node = %ip,
                    "Removing node"
                );
                node.remove_node(host_id).await
            }
        }
    }

    /// Whether the node is still busy with the operation.
    pub async fn still_running(self, node: &dyn NodeControl) -> OperatorResult<bool> {
        match self {
            PodOperationKind::Cleanup => node.has_compactions_of_type(COMPACTION_CLEANUP).await,
            PodOperationKind::UpgradeSSTables => {
                node.has_compactions_of_type(COMPACTION_UPGRADE_SSTABLES).await
            }
            PodOperationKind::Rebuild => node.has_streaming_sessions().await,
            PodOperationKind::Remove => Ok(!node.leaving_nodes().await?.is_empty()),
        }
    }

    /// Work left once the operation succeeded.
    pub async fn post_action<S: ObjectStore>(
        self,
        store: &S,
        config: &OperatorConfig,
        cc: &CassandraCluster,
        pod: &Pod,
    ) -> OperatorResult<()> {
        if self != PodOperationKind::Remove {
            return Ok(());
        }
        let target = RemoveTarget::from_pod(pod)?;
        let Some(name) = target.name else {
            tracing::info!(cluster = %cc.name_any(), "Node removed, no pod to delete");
            return Ok(());
        };
        let namespace = cc.namespace().unwrap_or_default();

        let pvc = pvc_name(&name);
        match store.delete::<PersistentVolumeClaim>(&namespace, &pvc, None).await {
            Ok(()) => wait_until_deleted(store, config, &namespace, &pvc).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::error!(cluster = %cc.name_any(), pvc = %pvc, error = %e, "Cannot delete PVC, manual action required");
                return Err(e);
            }
        }

        match store.delete::<Pod>(&namespace, &name, Some(0)).await {
            Ok(()) => {
                tracing::info!(cluster = %cc.name_any(), pod = %name, "Pod deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                tracing::error!(cluster = %cc.name_any(), pod = %name, error = %e, "Cannot delete pod, manual action required");
                Err(e)
            }
        }
    }
}

async fn wait_until_deleted<S: ObjectStore>(
    store: &S,
    config: &OperatorConfig,
    namespace: &str,
    pvc: &str,
) -> OperatorResult<()> {
    let started = Instant::now();
    loop {
        match store.get::<PersistentVolumeClaim>(namespace, pvc).await {
            Err(e) if e.is_not_found() => {
                tracing::info!(pvc = %pvc, "PVC deleted");
                return Ok(());
            }
            _ => tracing::info!(pvc = %pvc, "Waiting for PVC to be deleted"),
        }
        if started.elapsed() >= config.pvc_delete_timeout() {
            return Err(OperatorError::Timeout(format!("PVC {pvc} still exists")));
        }
        tokio::time::sleep(config.retry_interval()).await;
    }
}

/// Parsed `operation-argument` of a remove: `[name][_ip]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveTarget {
    /// Pod that ran the node.
    pub name: Option<String>,
    /// Address the node had.
    pub ip: Option<IpAddr>,
}

impl RemoveTarget {
    /// Parse an argument value.
    pub fn parse(argument: &str) -> OperatorResult<Self> {
        let (name, ip) = match argument.split_once('_') {
            Some((name, ip)) => (name, ip),
            None => (argument, ""),
        };
        if name.is_empty() && ip.is_empty() {
            return Err(OperatorError::ValidationError(
                "expected format is `[name][_ip]` with at least one value".into(),
            ));
        }
        let ip = if ip.is_empty() {
            None
        } else {
            Some(ip.parse::<IpAddr>().map_err(|_| {
                OperatorError::ValidationError(format!("{ip} is not an IP address"))
            })?)
        };
        Ok(Self {
            name: (!name.is_empty()).then(|| name.to_string()),
            ip,
        })
    }

    fn from_pod(pod: &Pod) -> OperatorResult<Self> {
        let argument = pod_label(pod, LABEL_OPERATION_ARGUMENT).ok_or_else(|| {
            OperatorError::ValidationError("operation-argument must name the node to remove".into())
        })?;
        Self::parse(argument)
    }

    async fn ip_from_pod<S: ObjectStore>(&self, store: &S, cc: &CassandraCluster) -> OperatorResult<String> {
        let name = self.name.as_deref().unwrap_or_default();
        let namespace = cc.namespace().unwrap_or_default();
        let pod: Pod = match store.get(&namespace, name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                return Err(OperatorError::ValidationError(format!(
                    "pod {name} not found, its old IP is needed to remove it"
                )));
            }
            Err(e) => return Err(e),
        };
        pod.status
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                OperatorError::ValidationError(format!(
                    "pod {name} has no IP, its old IP is needed to remove it"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_argument_forms() {
        let both = RemoveTarget::parse("c-dc1-rack1-2_10.0.0.7").unwrap();
        assert_eq!(both.name.as_deref(), Some("c-dc1-rack1-2"));
        assert_eq!(both.ip, Some("10.0.0.7".parse().unwrap()));

        let name_only = RemoveTarget::parse("c-dc1-rack1-2").unwrap();
        assert_eq!(name_only.ip, None);

        let ip_only = RemoveTarget::parse("_10.0.0.7").unwrap();
        assert_eq!(ip_only.name, None);

        assert!(RemoveTarget::parse("").is_err());
        assert!(RemoveTarget::parse("_").is_err());
        assert!(RemoveTarget::parse("pod_not-an-ip").is_err());
    }

    #[test]
    fn kinds_map_to_label_names() {
        let names: Vec<&str> = PodOperationKind::ALL.iter().map(|k| k.name().as_str()).collect();
        assert_eq!(names, vec!["cleanup", "upgradesstables", "rebuild", "remove"]);
    }
}
