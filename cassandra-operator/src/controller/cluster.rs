//! CassandraCluster controller.
//!
//! Reconciles CassandraCluster resources rack by rack, never changing two
//! racks in the same pass.

use super::children::{
    delete_dc_objects, delete_rack_pvcs, ensure_pod_disruption_budget, ensure_services,
    label_rack_pods, set_pvc_finalizer,
};
use super::statefulset::ensure_statefulset;
use super::status::{
    RackEffect, RackView, flip_seed_list_status, next_rack_status, update_cluster_phase,
    update_rack_phase,
};
use super::validation::{DcDataCheck, check_non_allowed_changes, last_applied};
use super::{ControllerContext, PodOperations, ReconcileAction, Resync, write_status};
use crate::crd::{
    ANNOTATION_LAST_APPLIED, ActionKind, ActionStatus, CassandraCluster, CassandraClusterStatus,
    ClusterPhase, OperationName, dc_rack_name,
};
use crate::error::{OperatorError, OperatorResult};
use crate::resources::{
    LABEL_OPERATION_NAME, LABEL_OPERATION_STATUS, dc_rack_labels, pod_is_running, sort_pods,
    statefulset_name,
};
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What the rack loop does after the observation step of a rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RackFlow {
    /// Go on with the Services and the StatefulSet of this rack.
    Proceed,
    /// Leave this rack alone and look at the next one.
    Skip,
    /// End the rack loop.
    Stop,
}

/// Controller for CassandraCluster resources.
pub struct CassandraClusterController<S> {
    ctx: Arc<ControllerContext<S>>,
    operations: Arc<PodOperations<S>>,
}

impl<S> Clone for CassandraClusterController<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            operations: self.operations.clone(),
        }
    }
}

impl<S: ObjectStore> CassandraClusterController<S> {
    /// Create a controller and start its pod-operation collector.
    pub fn new(ctx: Arc<ControllerContext<S>>) -> Self {
        let operations = Arc::new(PodOperations::new(ctx.clone()));
        Self { ctx, operations }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ControllerContext<S>> {
        &self.ctx
    }

    /// Background pod operations.
    pub fn operations(&self) -> &PodOperations<S> {
        &self.operations
    }

    /// Stop background work.
    pub async fn shutdown(&self) {
        self.operations.shutdown().await;
    }

    /// Reconcile a CassandraCluster resource.
    ///
    /// 1. Fetches the latest stored object
    /// 2. Initializes defaults and status on first sight
    /// 3. Follows the deletePVC finalizer
    /// 4. Validates the change against the last applied configuration
    /// 5. Walks the racks
    /// 6. Persists spec corrections, the annotation and the status
    pub async fn reconcile(&self, cluster: Arc<CassandraCluster>) -> OperatorResult<ReconcileAction> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| OperatorError::InvalidConfig("CassandraCluster must be namespaced".into()))?;

        tracing::info!(cluster = %name, namespace = %namespace, "Reconciling CassandraCluster");

        let mut cc: CassandraCluster = match self.ctx.store.get(&namespace, &name).await {
            Ok(cc) => cc,
            Err(e) if e.is_not_found() => {
                tracing::debug!(cluster = %name, "CassandraCluster is gone");
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(e),
        };

        if cc.status.as_ref().and_then(|s| s.phase).is_none() {
            self.initialize(&mut cc).await?;
            return Ok(ReconcileAction::requeue_short());
        }

        self.check_delete_pvc(&mut cc).await?;

        let stored = cc.clone();
        let mut status = cc.status.clone().unwrap_or_default();
        let action = self.reconcile_cluster(&mut cc, &mut status).await;

        if let Err(e) = self.persist(&stored, &mut cc, &status).await {
            if e.is_conflict() {
                tracing::info!(cluster = %name, "CassandraCluster changed during the pass, retrying");
                return Ok(ReconcileAction::requeue_short());
            }
            return Err(e);
        }

        self.ctx
            .metrics
            .set_phase(&name, status.phase.unwrap_or_default());
        if let Some(last) = status.last_cluster_action {
            self.ctx.metrics.set_action(&name, last);
        }
        action
    }

    async fn initialize(&self, cc: &mut CassandraCluster) -> OperatorResult<()> {
        let namespace = cc.namespace().unwrap_or_default();
        cc.set_defaults(self.ctx.now());
        let delete_pvc = cc.spec.delete_pvc;
        set_pvc_finalizer(cc, delete_pvc);
        let status = cc.status.clone().unwrap_or_default();

        tracing::info!(cluster = %cc.name_any(), racks = status.cassandra_rack_status.len(), "Initialization: update CassandraCluster");
        let updated = self.ctx.store.update(&namespace, cc).await?;
        cc.metadata.resource_version = updated.resource_version();
        write_status(self.ctx.store.as_ref(), cc, &status).await?;
        self.ctx.metrics.set_phase(&cc.name_any(), ClusterPhase::Initializing);
        Ok(())
    }

    /// Keep the PVC finalizer in line with a changed `deletePVC`.
    async fn check_delete_pvc(&self, cc: &mut CassandraCluster) -> OperatorResult<()> {
        let Some(applied) = cc.stored_last_applied() else {
            return Ok(());
        };
        let old: CassandraCluster = match serde_json::from_str(applied) {
            Ok(old) => old,
            Err(e) => {
                tracing::error!(cluster = %cc.name_any(), error = %e, "Cannot parse the last applied configuration");
                return Ok(());
            }
        };
        if old.spec.delete_pvc == cc.spec.delete_pvc {
            return Ok(());
        }

        tracing::debug!(cluster = %cc.name_any(), "deletePVC changed");
        let delete_pvc = cc.spec.delete_pvc;
        if set_pvc_finalizer(cc, delete_pvc) {
            let updated = self
                .ctx
                .store
                .update(&cc.namespace().unwrap_or_default(), cc)
                .await?;
            cc.metadata.resource_version = updated.resource_version();
        }
        Ok(())
    }

    async fn reconcile_cluster(
        &self,
        cc: &mut CassandraCluster,
        status: &mut CassandraClusterStatus,
    ) -> OperatorResult<ReconcileAction> {
        if self.validate(cc, status).await {
            return Ok(ReconcileAction::Requeue(self.ctx.config.blocked_requeue()));
        }

        let no_disruption = match ensure_pod_disruption_budget(&self.ctx, cc).await {
            Ok(no_disruption) => no_disruption,
            Err(e) => {
                tracing::error!(cluster = %cc.name_any(), error = %e, "Cannot ensure the PodDisruptionBudget");
                false
            }
        };

        if let Err(e) = self.reconcile_racks(cc, status, no_disruption).await {
            tracing::error!(cluster = %cc.name_any(), error = %e, "Rack reconciliation failed");
            return Ok(ReconcileAction::requeue_short());
        }

        if flip_seed_list_status(cc, status) {
            tracing::info!(cluster = %cc.name_any(), "Every rack is ready, seed list update starts");
        }
        update_cluster_phase(cc, status);
        Ok(ReconcileAction::Requeue(self.ctx.config.requeue()))
    }

    /// Apply the change validator. Returns `true` when the pass must stop.
    async fn validate(&self, cc: &mut CassandraCluster, status: &mut CassandraClusterStatus) -> bool {
        let Some(old) = last_applied(cc) else {
            return false;
        };
        let data_check = match cc.find_dc_with_nodes_to_0() {
            Some((dc, index)) => Some(self.probe_dc_data(cc, &dc, index).await),
            None => None,
        };

        let validation = check_non_allowed_changes(cc, &old, status, data_check.as_ref());
        cc.spec = validation.spec;

        if validation.update_resources {
            let now = self.ctx.now();
            for (dc_rack, rack) in status.cassandra_rack_status.iter_mut() {
                tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Update rack status UpdateResources=ToDo");
                let action = &mut rack.cassandra_last_action;
                action.name = Some(ActionKind::UpdateResources);
                action.status = Some(ActionStatus::ToDo);
                action.start_time = Some(now);
                action.end_time = None;
            }
            self.ctx.metrics.set_action(&cc.name_any(), ActionKind::UpdateResources);
        }

        if !validation.outcome.blocked {
            return false;
        }
        if let Some(reason) = validation.outcome.reason {
            status.last_cluster_action = Some(reason);
            self.ctx.metrics.set_action(&cc.name_any(), reason);
        }
        if let Some(removed_dc) = &validation.removed_dc {
            let removed = cc.fix_rack_list(status);
            tracing::info!(cluster = %cc.name_any(), dc = %removed_dc, racks = ?removed, "Deleting objects of the removed DC");
            delete_dc_objects(&self.ctx, cc, removed_dc, &removed).await;
        }
        true
    }

    /// Ask a node of `dc` whether keyspaces still replicate data to it.
    async fn probe_dc_data(&self, cc: &CassandraCluster, dc: &str, index: usize) -> DcDataCheck {
        let rack = cc.spec.topology.dc[index]
            .rack
            .first()
            .map(|r| r.name.clone())
            .unwrap_or_default();
        let namespace = cc.namespace().unwrap_or_default();
        let mut pods: Vec<Pod> = match self.ctx.store.list(&namespace, &dc_rack_labels(cc, dc, &rack)).await {
            Ok(pods) => pods,
            Err(e) => return DcDataCheck::Unverifiable(format!("cannot list pods: {e}")),
        };
        if pods.is_empty() {
            return DcDataCheck::NoPods;
        }
        sort_pods(&mut pods);
        let Some(pod) = pods.iter().find(|p| pod_is_running(p)) else {
            return DcDataCheck::Unverifiable(format!("no running pod in {dc} to ask"));
        };

        let keyspaces = match self.ctx.nodes.connect(cc, pod).await {
            Ok(node) => node.has_data_in_dc(dc).await,
            Err(e) => Err(e),
        };
        match keyspaces {
            Ok(keyspaces) if keyspaces.is_empty() => DcDataCheck::NoData,
            Ok(keyspaces) => DcDataCheck::HasData(keyspaces),
            Err(e) => DcDataCheck::Unverifiable(e.to_string()),
        }
    }

    /// Walk the racks in declaration order, stopping at the first one that
    /// is still busy.
    async fn reconcile_racks(
        &self,
        cc: &mut CassandraCluster,
        status: &mut CassandraClusterStatus,
        no_disruption: bool,
    ) -> OperatorResult<()> {
        let namespace = cc.namespace().unwrap_or_default();
        let deleting = cc.metadata.deletion_timestamp.is_some() && cc.spec.delete_pvc;

        for (dc, rack) in cc.dc_rack_pairs() {
            let dc_rack = dc_rack_name(&dc, &rack);
            if dc_rack.is_empty() {
                return Err(OperatorError::InvalidConfig(format!(
                    "DC {dc:?} and rack {rack:?} do not form a valid name"
                )));
            }

            if !status.cassandra_rack_status.contains_key(&dc_rack) {
                tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "New rack, initializing its status");
                self.ctx.metrics.set_phase(&cc.name_any(), ClusterPhase::Initializing);
                CassandraCluster::init_rack_status(status, &dc, &rack, self.ctx.now());
                return Ok(());
            }

            if deleting {
                delete_rack_pvcs(&self.ctx, cc, &dc, &rack).await;
                continue;
            }

            match self
                .ctx
                .store
                .get::<StatefulSet>(&namespace, &statefulset_name(cc, &dc_rack))
                .await
            {
                Ok(sts) => match self.observe_rack(cc, status, &dc, &rack, &sts, no_disruption).await? {
                    RackFlow::Proceed => {}
                    RackFlow::Skip => continue,
                    RackFlow::Stop => return Ok(()),
                },
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, error = %e, "Cannot get the StatefulSet");
                }
            }

            if let Err(e) = ensure_services(&self.ctx, cc, &dc, &rack).await {
                tracing::error!(cluster = %cc.name_any(), dc_rack = %dc_rack, error = %e, "Cannot ensure Services");
            }

            let resync = match ensure_statefulset(&self.ctx, cc, status, &dc, &rack, no_disruption).await {
                Ok(resync) => resync,
                Err(e) => {
                    tracing::error!(cluster = %cc.name_any(), dc_rack = %dc_rack, error = %e, "Cannot ensure the StatefulSet");
                    Resync::Break
                }
            };
            if cc.spec.unlock_next_operation {
                cc.spec.unlock_next_operation = false;
            }
            if resync.is_break() {
                tracing::debug!(cluster = %cc.name_any(), dc_rack = %dc_rack, "StatefulSet just changed, rack loop ends");
                return Ok(());
            }

            let settled = status.cassandra_rack_status.get(&dc_rack).is_some_and(|r| {
                r.phase == ClusterPhase::Running
                    && !r
                        .cassandra_last_action
                        .status_in(&[ActionStatus::Ongoing, ActionStatus::Finalizing])
            });
            if !settled {
                tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Waiting for the rack to be running before the next one");
                return Ok(());
            }
        }

        if deleting && set_pvc_finalizer(cc, false) {
            tracing::info!(cluster = %cc.name_any(), "PVCs deleted, cluster deletion unblocked");
        }
        Ok(())
    }

    /// Status transitions and pod operations of a rack whose StatefulSet exists.
    async fn observe_rack(
        &self,
        cc: &mut CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
        sts: &StatefulSet,
        no_disruption: bool,
    ) -> OperatorResult<RackFlow> {
        let dc_rack = dc_rack_name(dc, rack);
        let namespace = cc.namespace().unwrap_or_default();
        let mut pods: Vec<Pod> = self.ctx.store.list(&namespace, &dc_rack_labels(cc, dc, rack)).await?;
        sort_pods(&mut pods);

        let view = RackView {
            sts,
            pods: &pods,
            no_disruption,
            now: self.ctx.now(),
        };
        if let Some(rack_status) = status.cassandra_rack_status.get_mut(&dc_rack) {
            update_rack_phase(cc, &dc_rack, rack_status, &view);
        }
        for effect in next_rack_status(cc, status, &dc_rack, &view, self.ctx.config.delay_wait()) {
            match effect {
                RackEffect::LabelPodsForCleanup(state) => {
                    let labels: BTreeMap<String, String> = [
                        (LABEL_OPERATION_NAME.to_string(), OperationName::Cleanup.as_str().to_string()),
                        (LABEL_OPERATION_STATUS.to_string(), state.as_str().to_string()),
                    ]
                    .into();
                    label_rack_pods(&self.ctx, cc, dc, rack, &labels).await;
                }
                RackEffect::ClearRollingRestart => cc.clear_rolling_restart(&dc_rack),
            }
        }

        let phase = status.cassandra_rack_status.get(&dc_rack).map(|r| r.phase);
        if phase == Some(ClusterPhase::Initializing) {
            return Ok(RackFlow::Proceed);
        }

        let resync = match self.operations.execute(cc, status, dc, rack).await {
            Ok(resync) => resync,
            Err(e) => {
                tracing::error!(cluster = %cc.name_any(), dc_rack = %dc_rack, error = %e, "Executing pod operation failed");
                Resync::Break
            }
        };
        if !resync.is_break() {
            return Ok(RackFlow::Proceed);
        }

        let busy = status.cassandra_rack_status.get(&dc_rack).is_none_or(|r| {
            r.phase != ClusterPhase::Running
                || r.cassandra_last_action.status_in(&[
                    ActionStatus::ToDo,
                    ActionStatus::Ongoing,
                    ActionStatus::Continue,
                ])
        });
        if busy {
            tracing::debug!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Rack busy, StatefulSet left untouched");
            return Ok(RackFlow::Stop);
        }
        tracing::warn!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Pod operation asked to wait on a settled rack, moving to the next rack");
        Ok(RackFlow::Skip)
    }

    /// Write spec corrections, the last-applied annotation and the status.
    async fn persist(
        &self,
        stored: &CassandraCluster,
        cc: &mut CassandraCluster,
        status: &CassandraClusterStatus,
    ) -> OperatorResult<()> {
        let namespace = cc.namespace().unwrap_or_default();
        let applied = cc.last_applied_configuration()?;
        if cc.stored_last_applied() != Some(applied.as_str()) {
            cc.annotations_mut()
                .insert(ANNOTATION_LAST_APPLIED.to_string(), applied);
        }

        if cc.spec != stored.spec
            || cc.metadata.annotations != stored.metadata.annotations
            || cc.metadata.finalizers != stored.metadata.finalizers
        {
            match self.ctx.store.update(&namespace, cc).await {
                Ok(updated) => cc.metadata.resource_version = updated.resource_version(),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        if cc.status.as_ref() != Some(status) {
            match write_status(self.ctx.store.as_ref(), cc, status).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Error policy for the controller.
pub fn error_policy<S>(
    _cluster: Arc<CassandraCluster>,
    error: &OperatorError,
    _ctx: Arc<ControllerContext<S>>,
) -> Action {
    tracing::error!(error = %error, "Reconciliation error");
    Action::requeue(std::time::Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::testing::{FakeNodeFactory, MemoryStore};

    #[tokio::test]
    async fn error_policy_requeues_after_thirty_seconds() {
        let ctx = Arc::new(ControllerContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeNodeFactory::default()),
            OperatorConfig::default(),
        ));
        let cc = Arc::new(CassandraCluster::new("c", Default::default()));
        let action = error_policy(cc, &OperatorError::NodeControl("boom".into()), ctx);
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(30)));
    }
}
