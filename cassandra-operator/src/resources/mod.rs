//! Kubernetes object builders and small helpers over pods.
//!
//! Builders are pure: given a cluster (and its status for the seed list) they
//! return the desired object with a predictable name.

mod pdb;
mod service;
mod statefulset;

pub use pdb::build_pod_disruption_budget;
pub use service::{build_dc_rack_service, build_dc_service, build_exporter_service};
pub use statefulset::{
    build_statefulset, cassandra_image, statefulsets_are_equal, stored_seed_list,
};
pub(crate) use statefulset::{set_seed_env, stored_seed_env};

use crate::crd::CassandraCluster;
use chrono::{DateTime, NaiveDateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// `app` label.
pub const LABEL_APP: &str = "app";
/// Value of the `app` label.
pub const APP_NAME: &str = "cassandracluster";
/// Cluster name label.
pub const LABEL_CLUSTER: &str = "cassandracluster";
/// `<dc>-<rack>` label.
pub const LABEL_DC_RACK: &str = "dc-rack";
/// DC label.
pub const LABEL_DC: &str = "cassandraclusters.db.orange.com.dc";
/// Rack label.
pub const LABEL_RACK: &str = "cassandraclusters.db.orange.com.rack";

/// Pod operation name label.
pub const LABEL_OPERATION_NAME: &str = "operation-name";
/// Pod operation status label.
pub const LABEL_OPERATION_STATUS: &str = "operation-status";
/// Pod operation start label (label time).
pub const LABEL_OPERATION_START: &str = "operation-start";
/// Pod operation end label (label time).
pub const LABEL_OPERATION_END: &str = "operation-end";
/// Pod operation argument label.
pub const LABEL_OPERATION_ARGUMENT: &str = "operation-argument";
/// Template label bumped to force a rolling restart.
pub const LABEL_ROLLING_RESTART: &str = "rolling-restart";

/// Main container name.
pub const CONTAINER_CASSANDRA: &str = "cassandra";
/// Init container carrying the bootstrap environment.
pub const INIT_CONTAINER_BOOTSTRAP: &str = "bootstrap";
/// Seed list environment variable.
pub const ENV_SEEDS: &str = "CASSANDRA_SEEDS";

/// Finalizer keeping the cluster until its PVCs are deleted.
pub const FINALIZER_DELETE_PVC: &str = "kubernetes.io/pvc-to-delete";

const LABEL_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Labels shared by every object of the cluster.
pub fn cluster_labels(cc: &CassandraCluster) -> BTreeMap<String, String> {
    let mut labels = cc.labels().clone();
    labels.insert(LABEL_APP.into(), APP_NAME.into());
    labels.insert(LABEL_CLUSTER.into(), cc.name_any());
    labels
}

/// Labels of the objects of one DC.
pub fn dc_labels(cc: &CassandraCluster, dc: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cc);
    if !dc.is_empty() {
        labels.insert(LABEL_DC.into(), dc.into());
    }
    labels
}

/// Labels of the objects of one rack.
pub fn dc_rack_labels(cc: &CassandraCluster, dc: &str, rack: &str) -> BTreeMap<String, String> {
    let mut labels = dc_labels(cc, dc);
    labels.insert(LABEL_DC_RACK.into(), crate::crd::dc_rack_name(dc, rack));
    labels.insert(LABEL_RACK.into(), rack.into());
    labels
}

/// `<cluster>-<dc>-<rack>`: StatefulSet and headless Service of a rack.
pub fn statefulset_name(cc: &CassandraCluster, dc_rack: &str) -> String {
    format!("{}-{}", cc.name_any(), dc_rack)
}

/// `<cluster>-<dc>`.
pub fn dc_service_name(cc: &CassandraCluster, dc: &str) -> String {
    format!("{}-{}", cc.name_any(), dc)
}

/// `<cluster>-<dc>-exporter-jmx`.
pub fn exporter_service_name(cc: &CassandraCluster, dc: &str) -> String {
    format!("{}-{}-exporter-jmx", cc.name_any(), dc)
}

/// Data PVC of a pod, from the `data` claim template.
pub fn pvc_name(pod_name: &str) -> String {
    format!("data-{pod_name}")
}

/// Controller owner reference to the cluster.
pub fn owner_reference(cc: &CassandraCluster) -> OwnerReference {
    OwnerReference {
        api_version: "db.orange.com/v1alpha1".into(),
        kind: "CassandraCluster".into(),
        name: cc.name_any(),
        uid: cc.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

/// Timestamp usable as a label value (`YYYYMMDDTHHMMSS`).
pub fn label_time(now: DateTime<Utc>) -> String {
    now.format(LABEL_TIME_FORMAT).to_string()
}

/// Parse a [`label_time`] value.
pub fn parse_label_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, LABEL_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Trailing number of a pod name (`c-dc1-rack1-12` → 12).
pub fn pod_ordinal(name: &str) -> u32 {
    let digits: String = name
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

/// Sort pods by their trailing ordinal.
pub fn sort_pods(pods: &mut [Pod]) {
    pods.sort_by_key(|p| pod_ordinal(&p.name_any()));
}

/// Pod phase is Running and no deletion is pending.
pub fn pod_is_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// The cassandra container of a running pod reports ready.
pub fn cassandra_pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .container_statuses
            .iter()
            .flatten()
            .any(|c| c.name == CONTAINER_CASSANDRA && c.ready)
}

/// Value of a pod label.
pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.labels().get(key).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CassandraClusterSpec;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    #[test]
    fn label_time_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(label_time(t), "20240309T070501");
        assert_eq!(parse_label_time("20240309T070501"), Some(t));
        assert_eq!(parse_label_time("garbage"), None);
    }

    #[test]
    fn ordinals_and_sorting() {
        assert_eq!(pod_ordinal("c-dc1-rack1-12"), 12);
        assert_eq!(pod_ordinal("nodigits"), 0);

        let mut pods: Vec<Pod> = ["c-dc1-rack1-10", "c-dc1-rack1-2", "c-dc1-rack1-0"]
            .iter()
            .map(|n| {
                let mut p = Pod::default();
                p.metadata.name = Some(n.to_string());
                p
            })
            .collect();
        sort_pods(&mut pods);
        let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["c-dc1-rack1-0", "c-dc1-rack1-2", "c-dc1-rack1-10"]);
    }

    #[test]
    fn readiness_needs_running_cassandra_container() {
        let mut pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: CONTAINER_CASSANDRA.into(),
                    ready: true,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(cassandra_pod_is_ready(&pod));
        assert!(pod_is_running(&pod));

        pod.status.as_mut().unwrap().phase = Some("Pending".into());
        assert!(!cassandra_pod_is_ready(&pod));
        assert!(!pod_is_running(&pod));
    }

    #[test]
    fn rack_labels() {
        let mut cc = CassandraCluster::new("c", CassandraClusterSpec::default());
        cc.metadata.labels = Some([("team".to_string(), "db".to_string())].into());
        let labels = dc_rack_labels(&cc, "dc1", "rack1");
        assert_eq!(labels[LABEL_APP], APP_NAME);
        assert_eq!(labels[LABEL_CLUSTER], "c");
        assert_eq!(labels[LABEL_DC_RACK], "dc1-rack1");
        assert_eq!(labels[LABEL_DC], "dc1");
        assert_eq!(labels[LABEL_RACK], "rack1");
        assert_eq!(labels["team"], "db");
        assert_eq!(statefulset_name(&cc, "dc1-rack1"), "c-dc1-rack1");
        assert_eq!(exporter_service_name(&cc, "dc1"), "c-dc1-exporter-jmx");
    }
}
