//! Reconcile passes over a whole cluster lifecycle.

mod common;

use cassandra_operator::controller::ReconcileAction;
use cassandra_operator::crd::{
    ANNOTATION_LAST_APPLIED, ActionKind, ActionStatus, CassandraCluster, ClusterPhase,
};
use cassandra_operator::resources::{
    FINALIZER_DELETE_PVC, dc_rack_labels, dc_service_name, exporter_service_name, pvc_name,
};
use cassandra_operator::store::ObjectStore;
use cassandra_operator::testing::fixtures::{self, NAMESPACE};
use common::TestCluster;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::sync::Arc;

/// The first pass only fills in defaults and the initial status.
#[tokio::test]
async fn test_first_pass_initializes_status() {
    let cluster = TestCluster::new(fixtures::cluster("c", 3, &[("dc1", &["rack1", "rack2"])]));

    let action = cluster.reconcile().await;

    assert_eq!(action, ReconcileAction::requeue_short());
    let status = cluster.status();
    assert_eq!(status.phase, Some(ClusterPhase::Initializing));
    assert_eq!(status.cassandra_rack_status.len(), 2);
    let rack = cluster.rack("dc1-rack2");
    assert_eq!(rack.phase, ClusterPhase::Initializing);
    assert_eq!(rack.cassandra_last_action.name, Some(ActionKind::Initializing));
    assert!(cluster.statefulset("dc1-rack1").is_none());
}

/// Racks come up one after the other until the cluster is Running.
#[tokio::test]
async fn test_bring_up_creates_children() {
    let cluster = TestCluster::new(fixtures::cluster("c", 2, &[("dc1", &["rack1", "rack2"])]));
    cluster.reconcile().await;

    cluster.reconcile().await;
    assert!(cluster.statefulset("dc1-rack1").is_some());
    assert!(cluster.statefulset("dc1-rack2").is_none());

    cluster.bring_up().await;
    let cc = cluster.cluster();
    assert_eq!(cluster.replicas("dc1-rack1"), 2);
    assert_eq!(cluster.replicas("dc1-rack2"), 2);
    for service in [
        "c-dc1-rack1".to_string(),
        "c-dc1-rack2".to_string(),
        dc_service_name(&cc, "dc1"),
        exporter_service_name(&cc, "dc1"),
    ] {
        assert!(
            cluster.store.fetch::<Service>(NAMESPACE, &service).is_some(),
            "missing Service {service}"
        );
    }
    assert!(cluster.store.fetch::<PodDisruptionBudget>(NAMESPACE, "c").is_some());
    assert!(cc.annotations().contains_key(ANNOTATION_LAST_APPLIED));

    let status = cluster.status();
    assert_eq!(status.phase, Some(ClusterPhase::Running));
    assert_eq!(status.last_cluster_action_status, Some(ActionStatus::Done));
    assert!(
        cluster
            .controller
            .context()
            .metrics
            .encode()
            .contains("cassandra_operator_cluster_phase")
    );
}

/// A steady cluster is not written to.
#[tokio::test]
async fn test_steady_state_is_quiet() {
    let cluster = TestCluster::new(fixtures::cluster("c", 1, &[("dc1", &["rack1"])]));
    cluster.bring_up().await;
    cluster.reconcile().await;

    let writes = cluster.store.writes::<CassandraCluster>();
    cluster.reconcile().await;
    cluster.reconcile().await;
    assert_eq!(cluster.store.writes::<CassandraCluster>(), writes);
}

/// A cluster deleted since the event was queued ends the reconcile.
#[tokio::test]
async fn test_missing_cluster_is_done() {
    let cluster = TestCluster::new(fixtures::cluster("c", 1, &[("dc1", &["rack1"])]));
    let cc = cluster.cluster();
    cluster.store.remove::<CassandraCluster>(NAMESPACE, "c");

    let action = cluster.controller.reconcile(Arc::new(cc)).await.unwrap();
    assert_eq!(action, ReconcileAction::Done);
}

/// With deletePVC the cluster holds a finalizer until its PVCs are gone.
#[tokio::test]
async fn test_delete_pvc_on_cluster_deletion() {
    let mut cc = fixtures::cluster("c", 2, &[("dc1", &["rack1"])]);
    cc.spec.delete_pvc = true;
    let cluster = TestCluster::new(cc);
    cluster.bring_up().await;

    let cc = cluster.cluster();
    assert!(cc.finalizers().iter().any(|f| f == FINALIZER_DELETE_PVC));
    for i in 0..2 {
        cluster.store.insert(
            NAMESPACE,
            &PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(pvc_name(&format!("c-dc1-rack1-{i}"))),
                    labels: Some(dc_rack_labels(&cc, "dc1", "rack1")),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
    }

    cluster
        .store
        .delete::<CassandraCluster>(NAMESPACE, "c", None)
        .await
        .unwrap();
    assert!(cluster.cluster().metadata.deletion_timestamp.is_some());

    cluster.reconcile().await;

    assert!(cluster.store.fetch::<CassandraCluster>(NAMESPACE, "c").is_none());
    assert!(cluster.store.fetch_all::<PersistentVolumeClaim>(NAMESPACE).is_empty());
}

/// Turning deletePVC off drops the finalizer.
#[tokio::test]
async fn test_delete_pvc_toggle() {
    let mut cc = fixtures::cluster("c", 1, &[("dc1", &["rack1"])]);
    cc.spec.delete_pvc = true;
    let cluster = TestCluster::new(cc);
    cluster.bring_up().await;

    cluster.edit(|cc| cc.spec.delete_pvc = false);
    cluster.reconcile().await;

    assert!(cluster.cluster().finalizers().is_empty());
}

/// A write conflict ends the pass with a short requeue.
#[tokio::test]
async fn test_conflict_requeues() {
    let cluster = TestCluster::new(fixtures::cluster("c", 1, &[("dc1", &["rack1"])]));
    cluster.bring_up().await;

    cluster.edit(|cc| cc.spec.nodes_per_racks = 2);
    cluster.store.inject_conflicts::<CassandraCluster>(1);
    let action = cluster.reconcile().await;

    assert_eq!(action, ReconcileAction::requeue_short());
}
