//! Pod operations started through pod labels.

mod common;

use cassandra_operator::controller::{CassandraClusterController, PodOperationKind};
use cassandra_operator::crd::{ActionStatus, OperationName, PodLastOperation};
use cassandra_operator::node_control::COMPACTION_CLEANUP;
use cassandra_operator::resources::{
    LABEL_OPERATION_ARGUMENT, LABEL_OPERATION_END, LABEL_OPERATION_STATUS, dc_rack_labels,
};
use cassandra_operator::testing::fixtures::{self, NAMESPACE, OPERATOR_NAME};
use cassandra_operator::testing::{FakeNodeControl, NodeCall};
use cassandra_operator::{CassandraCluster, OperatorConfig};
use common::{TestCluster, eventually};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use std::time::Duration;

async fn three_nodes() -> TestCluster {
    let cluster = TestCluster::new(fixtures::cluster("c", 3, &[("dc1", &["rack1"])]));
    cluster.bring_up().await;
    cluster
}

async fn dispatch(cluster: &TestCluster, kind: PodOperationKind) -> CassandraCluster {
    let mut cc = cluster.cluster();
    let mut status = cc.status.clone().unwrap_or_default();
    cluster
        .controller
        .operations()
        .ensure_operation(&mut cc, &mut status, "dc1", "rack1", kind)
        .await
        .expect("ensure_operation failed");
    cc.status = Some(status);
    cc
}

fn last_operation(cluster: &TestCluster) -> PodLastOperation {
    cluster.rack("dc1-rack1").pod_last_operation
}

fn set_last_operation(cluster: &TestCluster, op: PodLastOperation) {
    cluster.edit(|cc| {
        if let Some(rack) = cc
            .status
            .as_mut()
            .and_then(|s| s.cassandra_rack_status.get_mut("dc1-rack1"))
        {
            rack.pod_last_operation = op;
        }
    });
}

/// A cleanup runs on the non-system keyspaces and is recorded as succeeded.
#[tokio::test]
async fn test_cleanup_succeeds() {
    let cluster = three_nodes().await;
    cluster.label_pod("c-dc1-rack1-0", "cleanup", "ToDo");

    dispatch(&cluster, PodOperationKind::Cleanup).await;
    let op = last_operation(&cluster);
    assert!(op.is(OperationName::Cleanup, ActionStatus::Ongoing));
    assert_eq!(op.operator_name, OPERATOR_NAME);

    eventually("cleanup recorded", || last_operation(&cluster).pods_ok == ["c-dc1-rack1-0"]).await;
    assert!(last_operation(&cluster).pods.is_empty());
    assert_eq!(
        cluster.pod_label("c-dc1-rack1-0", LABEL_OPERATION_STATUS).as_deref(),
        Some("Done")
    );
    assert!(cluster.pod_label("c-dc1-rack1-0", LABEL_OPERATION_END).is_some_and(|v| !v.is_empty()));
    assert_eq!(cluster.nodes.node().calls(), [NodeCall::Cleanup(vec!["ks1".into()])]);
}

/// A failing node ends with the pod in podsKO and labelled Error.
#[tokio::test]
async fn test_cleanup_failure_is_recorded() {
    let cluster = three_nodes().await;
    cluster.nodes.node().fail("cleanup");
    cluster.label_pod("c-dc1-rack1-1", "cleanup", "ToDo");

    dispatch(&cluster, PodOperationKind::Cleanup).await;

    eventually("failure recorded", || last_operation(&cluster).pods_ko == ["c-dc1-rack1-1"]).await;
    assert!(last_operation(&cluster).pods_ok.is_empty());
    assert_eq!(
        cluster.pod_label("c-dc1-rack1-1", LABEL_OPERATION_STATUS).as_deref(),
        Some("Error")
    );
}

/// Once every labelled pod is finished the operation is Done.
#[tokio::test]
async fn test_operation_done_when_no_pod_left() {
    let cluster = three_nodes().await;
    cluster.label_pod("c-dc1-rack1-0", "upgradesstables", "ToDo");
    cluster.label_pod("c-dc1-rack1-2", "upgradesstables", "ToDo");

    dispatch(&cluster, PodOperationKind::UpgradeSSTables).await;
    eventually("both pods finished", || last_operation(&cluster).pods_ok.len() == 2).await;

    let cc = dispatch(&cluster, PodOperationKind::UpgradeSSTables).await;
    let op = &cc.status.unwrap_or_default().cassandra_rack_status["dc1-rack1"].pod_last_operation;
    assert!(op.is(OperationName::UpgradeSSTables, ActionStatus::Done));
    assert!(op.end_time.is_some());

    let calls = cluster.nodes.node().calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| matches!(c, NodeCall::UpgradeSSTables(ks, 0) if ks.len() == 3)));
}

/// A remove resolves the host id of the old address, then drops the PVC and the pod.
#[tokio::test]
async fn test_remove_node() {
    let cluster = three_nodes().await;
    cluster.nodes.set_node(
        "c-dc1-rack1-0",
        Arc::new(FakeNodeControl::new().with_host_ids(&[("10.0.0.3", "host-3")])),
    );
    let cc = cluster.cluster();
    cluster.store.insert(
        NAMESPACE,
        &PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-c-dc1-rack1-2".into()),
                labels: Some(dc_rack_labels(&cc, "dc1", "rack1")),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    cluster.label_pod("c-dc1-rack1-0", "remove", "ToDo");
    cluster.store.modify::<Pod>(NAMESPACE, "c-dc1-rack1-0", |pod| {
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_OPERATION_ARGUMENT.into(), "c-dc1-rack1-2_10.0.0.3".into());
    });

    dispatch(&cluster, PodOperationKind::Remove).await;

    eventually("remove recorded", || last_operation(&cluster).pods_ok == ["c-dc1-rack1-0"]).await;
    assert_eq!(
        cluster.nodes.node_for("c-dc1-rack1-0").calls(),
        [NodeCall::RemoveNode("host-3".into())]
    );
    assert!(cluster.pod("c-dc1-rack1-2").is_none());
    assert!(
        cluster
            .store
            .fetch::<PersistentVolumeClaim>(NAMESPACE, "data-c-dc1-rack1-2")
            .is_none()
    );
}

/// A rebuild from an unknown DC fails without touching the node.
#[tokio::test]
async fn test_rebuild_needs_existing_dc() {
    let cluster = three_nodes().await;
    cluster.label_pod("c-dc1-rack1-0", "rebuild", "ToDo");
    cluster.store.modify::<Pod>(NAMESPACE, "c-dc1-rack1-0", |pod| {
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_OPERATION_ARGUMENT.into(), "dc9".into());
    });

    dispatch(&cluster, PodOperationKind::Rebuild).await;

    eventually("rebuild refused", || last_operation(&cluster).pods_ko == ["c-dc1-rack1-0"]).await;
    assert!(cluster.nodes.node().calls().is_empty());
}

/// An Ongoing operation left by another operator instance is monitored, not restarted.
#[tokio::test]
async fn test_adopted_operation_is_monitored() {
    let cluster = three_nodes().await;
    cluster.nodes.node().set_compaction(COMPACTION_CLEANUP, true);
    cluster.label_pod("c-dc1-rack1-1", "cleanup", "Ongoing");
    set_last_operation(
        &cluster,
        PodLastOperation {
            name: Some(OperationName::Cleanup),
            status: Some(ActionStatus::Ongoing),
            operator_name: "cassandra-operator-old".into(),
            pods: vec!["c-dc1-rack1-1".into()],
            ..Default::default()
        },
    );

    let cc = dispatch(&cluster, PodOperationKind::Cleanup).await;
    let op = &cc.status.unwrap_or_default().cassandra_rack_status["dc1-rack1"].pod_last_operation;
    assert_eq!(op.operator_name, OPERATOR_NAME);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        cluster.pod_label("c-dc1-rack1-1", LABEL_OPERATION_STATUS).as_deref(),
        Some("Ongoing")
    );

    cluster.nodes.node().set_compaction(COMPACTION_CLEANUP, false);
    eventually("adopted cleanup recorded", || {
        last_operation(&cluster).pods_ok == ["c-dc1-rack1-1"]
    })
    .await;
    assert!(cluster.nodes.node().calls().is_empty());
}

/// Pods labelled for another operation wait while one is running on the rack.
#[tokio::test]
async fn test_one_operation_per_rack() {
    let cluster = three_nodes().await;
    set_last_operation(
        &cluster,
        PodLastOperation {
            name: Some(OperationName::UpgradeSSTables),
            status: Some(ActionStatus::Ongoing),
            operator_name: OPERATOR_NAME.into(),
            pods: vec!["c-dc1-rack1-2".into()],
            ..Default::default()
        },
    );
    cluster.label_pod("c-dc1-rack1-0", "cleanup", "ToDo");

    dispatch(&cluster, PodOperationKind::Cleanup).await;

    assert_eq!(
        cluster.pod_label("c-dc1-rack1-0", LABEL_OPERATION_STATUS).as_deref(),
        Some("ToDo")
    );
    assert_eq!(cluster.controller.operations().in_flight(), 0);
    assert!(cluster.nodes.node().calls().is_empty());
}

/// Without an operator identity no pod operation starts.
#[tokio::test]
async fn test_no_operator_name_disables_operations() {
    let cluster = three_nodes().await;
    let config = OperatorConfig {
        operator_name: String::new(),
        ..fixtures::fast_config()
    };
    let ctx = cassandra_operator::controller::ControllerContext::new(
        cluster.store.clone(),
        cluster.nodes.clone(),
        config,
    )
    .with_clock(cluster.clock.clone());
    let controller = CassandraClusterController::new(Arc::new(ctx));
    cluster.label_pod("c-dc1-rack1-0", "cleanup", "ToDo");

    let mut cc = cluster.cluster();
    let mut status = cc.status.clone().unwrap_or_default();
    controller
        .operations()
        .ensure_operation(&mut cc, &mut status, "dc1", "rack1", PodOperationKind::Cleanup)
        .await
        .expect("ensure_operation failed");

    assert_eq!(
        cluster.pod_label("c-dc1-rack1-0", LABEL_OPERATION_STATUS).as_deref(),
        Some("ToDo")
    );
    assert!(cluster.nodes.node().calls().is_empty());
}

/// Shutdown does not wait for a slow node.
#[tokio::test]
async fn test_shutdown_aborts_running_operations() {
    let cluster = three_nodes().await;
    cluster.nodes.set_node(
        "c-dc1-rack1-0",
        Arc::new(FakeNodeControl::new().with_latency(Duration::from_secs(60))),
    );
    cluster.label_pod("c-dc1-rack1-0", "cleanup", "ToDo");

    dispatch(&cluster, PodOperationKind::Cleanup).await;
    eventually("cleanup started", || {
        !cluster.nodes.node_for("c-dc1-rack1-0").calls().is_empty()
    })
    .await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), cluster.controller.shutdown()).await;
    assert!(stopped.is_ok());
    assert_eq!(cluster.controller.operations().in_flight(), 0);
    assert_eq!(last_operation(&cluster).pods, ["c-dc1-rack1-0"]);
}
