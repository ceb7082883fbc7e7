//! Ready-made clusters, pods and contexts.

use super::{FakeNodeFactory, MemoryStore};
use crate::clock::MockClock;
use crate::config::OperatorConfig;
use crate::controller::ControllerContext;
use crate::crd::{CassandraCluster, CassandraClusterSpec, Dc, Rack, Topology, dc_rack_name};
use crate::resources::{CONTAINER_CASSANDRA, build_pod_disruption_budget, dc_rack_labels, statefulset_name};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::sync::Arc;

/// Namespace of every fixture.
pub const NAMESPACE: &str = "ns";

/// Operator identity of [`fast_config`].
pub const OPERATOR_NAME: &str = "cassandra-operator-0";

/// A cluster with `nodes_per_racks` nodes in each rack of `topology`.
///
/// `topology` lists `(dc, racks)` in declaration order.
pub fn cluster(name: &str, nodes_per_racks: i32, topology: &[(&str, &[&str])]) -> CassandraCluster {
    let dc = topology
        .iter()
        .map(|(dc, racks)| Dc {
            name: dc.to_string(),
            rack: racks
                .iter()
                .map(|r| Rack {
                    name: r.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    let mut cc = CassandraCluster::new(
        name,
        CassandraClusterSpec {
            nodes_per_racks,
            base_image: "cassandra".into(),
            version: "3.11.9".into(),
            image_pull_policy: "IfNotPresent".into(),
            data_capacity: "3Gi".into(),
            max_pod_unavailable: 1,
            auto_pilot: true,
            topology: Topology { dc },
            ..Default::default()
        },
    );
    cc.metadata.namespace = Some(NAMESPACE.into());
    cc
}

/// Configuration with millisecond waits.
pub fn fast_config() -> OperatorConfig {
    OperatorConfig {
        operator_name: OPERATOR_NAME.into(),
        monitor_interval_ms: 10,
        retry_interval_ms: 5,
        pvc_delete_timeout_ms: 100,
        sts_update_poll_ms: 1,
        sts_update_timeout_ms: 5,
        ..OperatorConfig::default()
    }
}

/// Context over the fakes with [`fast_config`] and a seeded generator.
pub fn context(
    store: Arc<MemoryStore>,
    nodes: Arc<FakeNodeFactory>,
    clock: Arc<MockClock>,
) -> ControllerContext<MemoryStore> {
    ControllerContext::new(store, nodes, fast_config())
        .with_clock(clock)
        .with_rng_seed(7)
}

/// Pod `ordinal` of the rack's StatefulSet, Running with a ready cassandra container.
pub fn running_pod(cc: &CassandraCluster, dc: &str, rack: &str, ordinal: u32) -> Pod {
    let sts = statefulset_name(cc, &dc_rack_name(dc, rack));
    let name = format!("{sts}-{ordinal}");
    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cc.namespace(),
            labels: Some(dc_rack_labels(cc, dc, rack)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(name),
            subdomain: Some(sts),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            pod_ip: Some(format!("10.0.0.{}", ordinal + 1)),
            container_statuses: Some(vec![ContainerStatus {
                name: CONTAINER_CASSANDRA.into(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Play the StatefulSet controller for one rack.
///
/// Creates or removes pods to match the wanted replicas and reports them all
/// ready on the current revision. Returns the replica count, or `None` when
/// the StatefulSet does not exist.
pub fn settle_statefulset(store: &MemoryStore, cc: &CassandraCluster, dc: &str, rack: &str) -> Option<i32> {
    let name = statefulset_name(cc, &dc_rack_name(dc, rack));
    let sts: StatefulSet = store.fetch(NAMESPACE, &name)?;
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);

    for ordinal in 0..replicas.max(0) as u32 {
        let pod = running_pod(cc, dc, rack, ordinal);
        if store.fetch::<Pod>(NAMESPACE, &pod.name_any()).is_none() {
            store.insert(NAMESPACE, &pod);
        }
    }
    for pod in store.fetch_all::<Pod>(NAMESPACE) {
        let ours = pod.name_any().starts_with(&format!("{name}-"));
        if ours && crate::resources::pod_ordinal(&pod.name_any()) >= replicas.max(0) as u32 {
            store.remove::<Pod>(NAMESPACE, &pod.name_any());
        }
    }

    store.modify::<StatefulSet>(NAMESPACE, &name, |sts| {
        sts.status = Some(StatefulSetStatus {
            replicas,
            ready_replicas: Some(replicas),
            current_replicas: Some(replicas),
            current_revision: Some("rev-1".into()),
            update_revision: Some("rev-1".into()),
            ..Default::default()
        });
    });
    Some(replicas)
}

/// Store the cluster's budget with `allowed` disruptions.
pub fn allow_disruptions(store: &MemoryStore, cc: &CassandraCluster, allowed: i32) {
    let mut pdb: PodDisruptionBudget = store
        .fetch(NAMESPACE, &cc.name_any())
        .unwrap_or_else(|| build_pod_disruption_budget(cc));
    pdb.status = Some(PodDisruptionBudgetStatus {
        disruptions_allowed: allowed,
        current_healthy: 1,
        desired_healthy: 1,
        expected_pods: 1,
        ..Default::default()
    });
    store.insert(NAMESPACE, &pdb);
}
