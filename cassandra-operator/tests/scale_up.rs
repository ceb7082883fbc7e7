//! Scale up, one node at a time.

mod common;

use cassandra_operator::crd::{ActionKind, ActionStatus};
use cassandra_operator::resources::{LABEL_OPERATION_NAME, LABEL_OPERATION_STATUS};
use cassandra_operator::testing::fixtures;
use common::TestCluster;

/// 3 → 5 adds one node per update and waits while a node is joining.
#[tokio::test]
async fn test_scale_up_waits_for_joining_nodes() {
    let cluster = TestCluster::new(fixtures::cluster("c", 3, &[("dc1", &["rack1"])]));
    cluster.bring_up().await;
    cluster.edit(|cc| cc.spec.nodes_per_racks = 5);

    cluster.reconcile().await;
    assert_eq!(cluster.replicas("dc1-rack1"), 4);
    let action = cluster.rack("dc1-rack1").cassandra_last_action;
    assert!(action.is(ActionKind::ScaleUp, ActionStatus::Ongoing));
    assert!(action.start_time.is_some());

    cluster.nodes.node().set_joining(&["10.0.0.4"]);
    cluster.settle();
    cluster.advance();
    cluster.reconcile().await;
    assert_eq!(cluster.replicas("dc1-rack1"), 4);

    cluster.nodes.node().set_joining(&[]);
    cluster.reconcile().await;
    assert_eq!(cluster.replicas("dc1-rack1"), 5);

    cluster.settle();
    cluster.advance();
    cluster.reconcile().await;
    let action = cluster.rack("dc1-rack1").cassandra_last_action;
    assert!(action.is(ActionKind::ScaleUp, ActionStatus::Done));

    for i in 0..5 {
        let pod = format!("c-dc1-rack1-{i}");
        assert_eq!(cluster.pod_label(&pod, LABEL_OPERATION_NAME).as_deref(), Some("cleanup"));
        assert_eq!(cluster.pod_label(&pod, LABEL_OPERATION_STATUS).as_deref(), Some("ToDo"));
    }
}

/// Without autoPilot the cleanup waits for an operator.
#[tokio::test]
async fn test_scale_up_cleanup_is_manual_without_auto_pilot() {
    let mut cc = fixtures::cluster("c", 1, &[("dc1", &["rack1"])]);
    cc.spec.auto_pilot = false;
    let cluster = TestCluster::new(cc);
    cluster.bring_up().await;
    cluster.edit(|cc| cc.spec.nodes_per_racks = 2);

    cluster.reconcile().await;
    cluster.settle();
    cluster.advance();
    cluster.reconcile().await;

    assert!(
        cluster
            .rack("dc1-rack1")
            .cassandra_last_action
            .is(ActionKind::ScaleUp, ActionStatus::Done)
    );
    assert_eq!(
        cluster.pod_label("c-dc1-rack1-1", LABEL_OPERATION_STATUS).as_deref(),
        Some("Manual")
    );
}

/// A rack is only scaled once the racks before it are settled.
#[tokio::test]
async fn test_racks_scale_in_order() {
    let cluster = TestCluster::new(fixtures::cluster("c", 1, &[("dc1", &["rack1", "rack2"])]));
    cluster.bring_up().await;
    cluster.edit(|cc| cc.spec.nodes_per_racks = 2);

    cluster.reconcile().await;
    assert_eq!(cluster.replicas("dc1-rack1"), 2);
    assert_eq!(cluster.replicas("dc1-rack2"), 1);

    cluster.settle();
    cluster.advance();
    cluster.reconcile().await;
    cluster.reconcile().await;
    assert_eq!(cluster.replicas("dc1-rack2"), 2);
}
