//! Reconciliation of CassandraCluster resources.
//!
//! [`CassandraClusterController`] walks the racks of a cluster in declaration
//! order and moves each one through its actions:
//!
//! - [`status`]: pure rack/cluster status transitions
//! - [`validation`]: rejection of spec changes the StatefulSets cannot follow
//! - `decommission`: scale down, one node at a time
//! - [`pod_operation`]: cleanup, upgradesstables, rebuild and remove on labelled pods
//!
//! # Usage with kube-runtime
//!
//! ```ignore
//! use cassandra_operator::controller::{CassandraClusterController, ControllerContext, error_policy};
//!
//! let controller = CassandraClusterController::new(Arc::new(ctx));
//! Controller::new(clusters, watcher_config)
//!     .run(|cluster, _| {
//!         let controller = controller.clone();
//!         async move { controller.reconcile(cluster).await }
//!     }, error_policy, context)
//!     .for_each(|_| futures::future::ready(()))
//!     .await;
//! ```

mod children;
mod cluster;
mod decommission;
pub mod operations;
pub mod pod_operation;
mod statefulset;
pub mod status;
pub mod validation;

pub use cluster::{CassandraClusterController, error_policy};
pub use operations::PodOperationKind;
pub use pod_operation::PodOperations;

use crate::clock::{Clock, SystemClock};
use crate::config::OperatorConfig;
use crate::crd::{CassandraCluster, CassandraClusterStatus};
use crate::error::OperatorResult;
use crate::metrics::Metrics;
use crate::node_control::NodeControlFactory;
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Shared context for the controller and its background tasks.
pub struct ControllerContext<S> {
    /// Kubernetes objects.
    pub store: Arc<S>,
    /// Access to Cassandra nodes.
    pub nodes: Arc<dyn NodeControlFactory>,
    /// Tunables.
    pub config: OperatorConfig,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Exported gauges.
    pub metrics: Arc<Metrics>,
    rng: Mutex<StdRng>,
}

impl<S: ObjectStore> ControllerContext<S> {
    /// Create a context on the system clock with a fresh metrics registry.
    pub fn new(store: Arc<S>, nodes: Arc<dyn NodeControlFactory>, config: OperatorConfig) -> Self {
        Self {
            store,
            nodes,
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(Metrics::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use another clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a shared metrics registry.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Seed the generator picking pod operations.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Current time from the context clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn random_operation(&self) -> PodOperationKind {
        let index = self.rng.lock().gen_range(0..PodOperationKind::ALL.len());
        PodOperationKind::ALL[index]
    }
}

/// Result type for reconciliation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Don't requeue (reconciliation complete).
    Done,
}

impl ReconcileAction {
    /// Requeue after 5 seconds (default for transient errors).
    pub fn requeue_short() -> Self {
        Self::Requeue(Duration::from_secs(5))
    }

    /// Requeue after 30 seconds (default for waiting on external resources).
    pub fn requeue_medium() -> Self {
        Self::Requeue(Duration::from_secs(30))
    }
}

/// Whether the rack loop may go on to the StatefulSet of the current rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resync {
    /// Keep going.
    Continue,
    /// Leave the StatefulSet alone this pass.
    Break,
}

impl Resync {
    /// `true` for [`Resync::Break`].
    pub fn is_break(self) -> bool {
        self == Resync::Break
    }
}

/// Persist `status` now and keep `cc` on the new resourceVersion.
///
/// Afterwards `cc.status` holds what is stored, so a later write in the same
/// pass only happens when the status moved again.
pub(crate) async fn write_status<S: ObjectStore>(
    store: &S,
    cc: &mut CassandraCluster,
    status: &CassandraClusterStatus,
) -> OperatorResult<()> {
    let mut candidate = cc.clone();
    candidate.status = Some(status.clone());
    let stored = store
        .update_status(&cc.namespace().unwrap_or_default(), &candidate)
        .await?;
    cc.metadata.resource_version = stored.resource_version();
    cc.status = Some(status.clone());
    Ok(())
}
