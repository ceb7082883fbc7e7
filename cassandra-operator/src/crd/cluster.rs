//! CassandraCluster Custom Resource Definition.
//!
//! Defines a Cassandra cluster spread over datacenters and racks, each rack
//! backed by one StatefulSet.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CassandraCluster is the Schema for the cassandraclusters API.
///
/// The operator creates one StatefulSet per `<dc>-<rack>` plus the Services
/// and PodDisruptionBudget around them, and drives topology changes one rack
/// and one node at a time.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.orange.com",
    version = "v1alpha1",
    kind = "CassandraCluster",
    plural = "cassandraclusters",
    shortname = "cassc",
    namespaced,
    status = "CassandraClusterStatus",
    printcolumn = r#"{"name":"NodesPerRacks", "type":"integer", "jsonPath":".spec.nodesPerRacks"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"LastAction", "type":"string", "jsonPath":".status.lastClusterAction"}"#,
    printcolumn = r#"{"name":"ActionStatus", "type":"string", "jsonPath":".status.lastClusterActionStatus"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterSpec {
    /// Cassandra nodes per rack, unless a DC overrides it.
    #[serde(default)]
    pub nodes_per_racks: i32,

    /// Cassandra image repository.
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// Cassandra image tag.
    #[serde(default = "default_version")]
    pub version: String,

    /// Image pull policy.
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Secret holding `username`/`password` for the Jolokia agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_jolokia_secret: Option<String>,

    /// Resource requirements of the cassandra container.
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Delete the PersistentVolumeClaims when the cluster is deleted.
    #[serde(default, rename = "deletePVC")]
    pub delete_pvc: bool,

    /// Run cleanups automatically after a scale-up.
    #[serde(default)]
    pub auto_pilot: bool,

    /// Push the StatefulSet even when it looks unchanged.
    #[serde(default)]
    pub no_check_sts_are_equal: bool,

    /// Recompute the seed list when the topology changes.
    #[serde(default)]
    pub auto_update_seed_list: bool,

    /// PodDisruptionBudget maxUnavailable.
    #[serde(default)]
    pub max_pod_unavailable: i32,

    /// Apply the next StatefulSet change even during a disruption. Reset once used.
    #[serde(default)]
    pub unlock_next_operation: bool,

    /// Size of the data volume (e.g., "10Gi").
    #[serde(default)]
    pub data_capacity: String,

    /// Storage class of the data volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_storage_class: Option<String>,

    /// ConfigMap mounted into the cassandra container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    /// Datacenters and racks.
    #[serde(default)]
    pub topology: Topology,
}

fn default_base_image() -> String {
    "cassandra".to_string()
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_image_pull_policy() -> String {
    "Always".to_string()
}

/// Cluster topology: an ordered list of datacenters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Datacenters, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dc: Vec<Dc>,
}

/// A Cassandra datacenter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dc {
    /// DC name, a DNS-1035 label.
    pub name: String,

    /// Node labels pods of this DC are scheduled on.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Racks, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rack: Vec<Rack>,

    /// Nodes per rack in this DC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_per_racks: Option<i32>,

    /// Tokens per node in this DC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_tokens: Option<i32>,

    /// Data volume size override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_capacity: Option<String>,

    /// Storage class override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_storage_class: Option<String>,
}

/// A rack inside a datacenter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    /// Rack name.
    pub name: String,

    /// Request a rolling restart of the rack.
    #[serde(default)]
    pub rolling_restart: bool,

    /// StatefulSet RollingUpdate partition.
    #[serde(default)]
    pub rolling_partition: i32,

    /// Node labels pods of this rack are scheduled on.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Resource requirements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,

    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

/// Resource specification (CPU and memory).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU (e.g., "1", "500m").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory (e.g., "1Gi", "512Mi").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// CassandraCluster status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterStatus {
    /// Current phase of the cluster. Absent until defaults are applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    /// Last action mirrored from the racks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cluster_action: Option<ActionKind>,

    /// Status of the last action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cluster_action_status: Option<ActionStatus>,

    /// Seed addresses handed to the nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seedlist: Vec<String>,

    /// Per `<dc>-<rack>` status.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cassandra_rack_status: BTreeMap<String, RackStatus>,
}

/// Status of one rack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RackStatus {
    /// Rack phase.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Last topology action applied to the rack.
    #[serde(default)]
    pub cassandra_last_action: LastAction,

    /// Last per-pod operation run in the rack.
    #[serde(default)]
    pub pod_last_operation: PodLastOperation,
}

/// A StatefulSet-level action and its progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastAction {
    /// Action kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<ActionKind>,

    /// Action status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,

    /// When the action started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the action ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Nodes already updated by the action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_nodes: Vec<String>,
}

impl LastAction {
    /// Whether the action is `name` with status `status`.
    pub fn is(&self, name: ActionKind, status: ActionStatus) -> bool {
        self.name == Some(name) && self.status == Some(status)
    }

    /// Whether the status is one of `statuses`.
    pub fn status_in(&self, statuses: &[ActionStatus]) -> bool {
        self.status.is_some_and(|s| statuses.contains(&s))
    }

    /// Replace with a fresh action; times are cleared.
    pub fn set(&mut self, name: ActionKind, status: ActionStatus) {
        self.name = Some(name);
        self.status = Some(status);
        self.start_time = None;
        self.end_time = None;
    }
}

/// A per-pod operation and the pods it touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodLastOperation {
    /// Operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<OperationName>,

    /// Operation status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,

    /// When the operation started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the operation ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Operator instance that owns the operation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_name: String,

    /// Pods the operation is running on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,

    /// Pods where the operation succeeded.
    #[serde(default, rename = "podsOK", skip_serializing_if = "Vec::is_empty")]
    pub pods_ok: Vec<String>,

    /// Pods where the operation failed.
    #[serde(default, rename = "podsKO", skip_serializing_if = "Vec::is_empty")]
    pub pods_ko: Vec<String>,
}

impl PodLastOperation {
    /// Whether the operation is `name` with status `status`.
    pub fn is(&self, name: OperationName, status: ActionStatus) -> bool {
        self.name == Some(name) && self.status == Some(status)
    }
}

/// Phase of a cluster or rack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    /// Pods are being created for the first time.
    #[default]
    Initializing,
    /// Every expected pod is ready.
    Running,
    /// Some pods are not ready.
    Pending,
}

impl ClusterPhase {
    /// Numeric id exported by the phase gauge.
    pub fn id(self) -> i64 {
        match self {
            ClusterPhase::Initializing => 1,
            ClusterPhase::Running => 2,
            ClusterPhase::Pending => 3,
        }
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Initializing => "Initializing",
            ClusterPhase::Running => "Running",
            ClusterPhase::Pending => "Pending",
        };
        f.write_str(s)
    }
}

/// Topology action applied to a rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ActionKind {
    /// Rack is still being created.
    Initializing,
    /// The mounted ConfigMap changed.
    UpdateConfigMap,
    /// The Cassandra image changed.
    UpdateDockerImage,
    /// The seed list changed.
    UpdateSeedList,
    /// A rolling restart was requested.
    RollingRestart,
    /// Container resources changed.
    UpdateResources,
    /// The StatefulSet is rolling out a new revision.
    UpdateStatefulSet,
    /// Nodes are being added.
    ScaleUp,
    /// Nodes are being decommissioned.
    ScaleDown,
    /// A datacenter was removed.
    #[serde(rename = "ActionDeleteDC")]
    DeleteDC,
    /// A forbidden change was reverted.
    CorrectCRDConfig,
}

impl ActionKind {
    /// Numeric id exported by the action gauge.
    pub fn id(self) -> i64 {
        match self {
            ActionKind::Initializing => 0,
            ActionKind::UpdateConfigMap => 1,
            ActionKind::UpdateDockerImage => 2,
            ActionKind::UpdateSeedList => 3,
            ActionKind::RollingRestart => 4,
            ActionKind::UpdateResources => 5,
            ActionKind::UpdateStatefulSet => 6,
            ActionKind::ScaleUp => 7,
            ActionKind::ScaleDown => 8,
            ActionKind::DeleteDC => 9,
            ActionKind::CorrectCRDConfig => 11,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same text as the serialized form.
        let s = match self {
            ActionKind::Initializing => "Initializing",
            ActionKind::UpdateConfigMap => "UpdateConfigMap",
            ActionKind::UpdateDockerImage => "UpdateDockerImage",
            ActionKind::UpdateSeedList => "UpdateSeedList",
            ActionKind::RollingRestart => "RollingRestart",
            ActionKind::UpdateResources => "UpdateResources",
            ActionKind::UpdateStatefulSet => "UpdateStatefulSet",
            ActionKind::ScaleUp => "ScaleUp",
            ActionKind::ScaleDown => "ScaleDown",
            ActionKind::DeleteDC => "ActionDeleteDC",
            ActionKind::CorrectCRDConfig => "CorrectCRDConfig",
        };
        f.write_str(s)
    }
}

/// Progress of an action or pod operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ActionStatus {
    /// Waiting to be applied.
    ToDo,
    /// Being applied.
    Ongoing,
    /// Between Ongoing and Done.
    Finalizing,
    /// Rack work finished, the StatefulSet may move on.
    Continue,
    /// Waiting for every rack to agree.
    Configuring,
    /// Finished.
    Done,
    /// Waits for a human to flip the pod label.
    Manual,
    /// Failed.
    Error,
}

impl ActionStatus {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::ToDo => "ToDo",
            ActionStatus::Ongoing => "Ongoing",
            ActionStatus::Finalizing => "Finalizing",
            ActionStatus::Continue => "Continue",
            ActionStatus::Configuring => "Configuring",
            ActionStatus::Done => "Done",
            ActionStatus::Manual => "Manual",
            ActionStatus::Error => "Error",
        }
    }

    /// Parse a label value.
    pub fn from_label(value: &str) -> Option<Self> {
        [
            ActionStatus::ToDo,
            ActionStatus::Ongoing,
            ActionStatus::Finalizing,
            ActionStatus::Continue,
            ActionStatus::Configuring,
            ActionStatus::Done,
            ActionStatus::Manual,
            ActionStatus::Error,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a per-pod operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationName {
    /// nodetool cleanup.
    Cleanup,
    /// nodetool upgradesstables.
    #[serde(rename = "upgradesstables")]
    UpgradeSSTables,
    /// nodetool rebuild.
    Rebuild,
    /// nodetool removenode.
    Remove,
    /// nodetool decommission.
    Decommission,
}

impl OperationName {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationName::Cleanup => "cleanup",
            OperationName::UpgradeSSTables => "upgradesstables",
            OperationName::Rebuild => "rebuild",
            OperationName::Remove => "remove",
            OperationName::Decommission => "decommission",
        }
    }

    /// Parse a label value.
    pub fn from_label(value: &str) -> Option<Self> {
        [
            OperationName::Cleanup,
            OperationName::UpgradeSSTables,
            OperationName::Rebuild,
            OperationName::Remove,
            OperationName::Decommission,
        ]
        .into_iter()
        .find(|o| o.as_str() == value)
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: CassandraClusterSpec = serde_json::from_value(serde_json::json!({
            "nodesPerRacks": 3,
            "deletePVC": true,
            "topology": {"dc": [{"name": "dc1", "rack": [{"name": "rack1"}]}]}
        }))
        .unwrap();

        assert_eq!(spec.nodes_per_racks, 3);
        assert!(spec.delete_pvc);
        assert_eq!(spec.base_image, "cassandra");
        assert_eq!(spec.topology.dc[0].rack[0].name, "rack1");
        assert_eq!(spec.topology.dc[0].nodes_per_racks, None);
    }

    #[test]
    fn status_wire_names() {
        let mut status = CassandraClusterStatus {
            phase: Some(ClusterPhase::Running),
            last_cluster_action: Some(ActionKind::DeleteDC),
            last_cluster_action_status: Some(ActionStatus::Done),
            ..Default::default()
        };
        status.cassandra_rack_status.insert(
            "dc1-rack1".into(),
            RackStatus {
                pod_last_operation: PodLastOperation {
                    name: Some(OperationName::UpgradeSSTables),
                    pods_ok: vec!["p-0".into()],
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastClusterAction"], "ActionDeleteDC");
        let op = &json["cassandraRackStatus"]["dc1-rack1"]["podLastOperation"];
        assert_eq!(op["name"], "upgradesstables");
        assert_eq!(op["podsOK"][0], "p-0");
    }

    #[test]
    fn gauge_ids() {
        assert_eq!(ClusterPhase::Pending.id(), 3);
        assert_eq!(ActionKind::ScaleDown.id(), 8);
        assert_eq!(ActionKind::CorrectCRDConfig.id(), 11);
    }

    #[test]
    fn label_values_parse_back() {
        assert_eq!(ActionStatus::from_label("Manual"), Some(ActionStatus::Manual));
        assert_eq!(ActionStatus::from_label("manual"), None);
        assert_eq!(
            OperationName::from_label("upgradesstables"),
            Some(OperationName::UpgradeSSTables)
        );
    }
}
