//! Common test utilities for cassandra-operator integration tests.

use cassandra_operator::controller::{CassandraClusterController, ReconcileAction};
use cassandra_operator::crd::{CassandraCluster, CassandraClusterStatus, RackStatus};
use cassandra_operator::resources::{LABEL_OPERATION_NAME, LABEL_OPERATION_STATUS, statefulset_name};
use cassandra_operator::testing::fixtures::{self, NAMESPACE};
use cassandra_operator::testing::{FakeNodeFactory, MemoryStore, MockClock};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;

/// A controller wired to in-memory fakes, with one cluster in the store.
#[allow(dead_code)]
pub struct TestCluster {
    /// Kubernetes objects.
    pub store: Arc<MemoryStore>,
    /// Cassandra nodes.
    pub nodes: Arc<FakeNodeFactory>,
    /// Time source of the controller.
    pub clock: Arc<MockClock>,
    /// Controller under test.
    pub controller: CassandraClusterController<MemoryStore>,
    /// Cluster name.
    pub name: String,
}

#[allow(dead_code)]
impl TestCluster {
    /// Store `cc` and build a controller around it.
    pub fn new(cc: CassandraCluster) -> Self {
        let store = Arc::new(MemoryStore::new());
        let nodes = Arc::new(FakeNodeFactory::default());
        let clock = Arc::new(MockClock::default());
        store.insert(NAMESPACE, &cc);
        let ctx = fixtures::context(store.clone(), nodes.clone(), clock.clone());
        Self {
            store,
            nodes,
            clock,
            controller: CassandraClusterController::new(Arc::new(ctx)),
            name: cc.name_any(),
        }
    }

    /// One reconcile pass on the stored cluster.
    pub async fn reconcile(&self) -> ReconcileAction {
        let cc = Arc::new(self.cluster());
        self.controller
            .reconcile(cc)
            .await
            .expect("reconcile failed")
    }

    /// Stored cluster.
    pub fn cluster(&self) -> CassandraCluster {
        self.store
            .fetch(NAMESPACE, &self.name)
            .expect("cluster not in store")
    }

    /// Stored cluster status.
    pub fn status(&self) -> CassandraClusterStatus {
        self.cluster().status.unwrap_or_default()
    }

    /// Stored status of a rack.
    pub fn rack(&self, dc_rack: &str) -> RackStatus {
        self.status()
            .cassandra_rack_status
            .get(dc_rack)
            .cloned()
            .unwrap_or_else(|| panic!("no status for rack {dc_rack}"))
    }

    /// Edit the stored cluster the way `kubectl apply` would.
    pub fn edit(&self, f: impl FnOnce(&mut CassandraCluster)) {
        assert!(self.store.modify::<CassandraCluster>(NAMESPACE, &self.name, f));
    }

    /// Stored StatefulSet of a rack.
    pub fn statefulset(&self, dc_rack: &str) -> Option<StatefulSet> {
        self.store
            .fetch(NAMESPACE, &statefulset_name(&self.cluster(), dc_rack))
    }

    /// Wanted replicas of a rack's StatefulSet.
    pub fn replicas(&self, dc_rack: &str) -> i32 {
        self.statefulset(dc_rack)
            .and_then(|s| s.spec)
            .and_then(|s| s.replicas)
            .unwrap_or_else(|| panic!("no StatefulSet for rack {dc_rack}"))
    }

    /// Stored pod.
    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.store.fetch(NAMESPACE, name)
    }

    /// Play the StatefulSet controller on every rack and allow one disruption.
    pub fn settle(&self) {
        let cc = self.cluster();
        for (dc, rack) in cc.dc_rack_pairs() {
            fixtures::settle_statefulset(&self.store, &cc, &dc, &rack);
        }
        fixtures::allow_disruptions(&self.store, &cc, 1);
    }

    /// Move the clock past every grace window.
    pub fn advance(&self) {
        self.clock.advance(chrono::Duration::minutes(1));
    }

    /// Reconcile and settle until the cluster is Running with its action Done.
    pub async fn bring_up(&self) {
        for _ in 0..10 {
            self.reconcile().await;
            self.settle();
            let status = self.status();
            if status.phase == Some(cassandra_operator::crd::ClusterPhase::Running)
                && status.last_cluster_action_status
                    == Some(cassandra_operator::crd::ActionStatus::Done)
            {
                self.advance();
                return;
            }
        }
        panic!("cluster did not come up: {:?}", self.status());
    }

    /// Put `operation-name`/`operation-status` labels on a pod.
    pub fn label_pod(&self, pod: &str, operation: &str, state: &str) {
        assert!(self.store.modify::<Pod>(NAMESPACE, pod, |p| {
            p.labels_mut().insert(LABEL_OPERATION_NAME.into(), operation.into());
            p.labels_mut().insert(LABEL_OPERATION_STATUS.into(), state.into());
        }));
    }

    /// Value of a pod label.
    pub fn pod_label(&self, pod: &str, key: &str) -> Option<String> {
        self.pod(pod).and_then(|p| p.labels().get(key).cloned())
    }
}

/// Poll `check` until it holds, for at most two seconds.
#[allow(dead_code)]
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
