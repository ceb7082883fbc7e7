//! Scale down of a rack, one node at a time.
//!
//! The rack's `podLastOperation` tracks the decommission:
//! ToDo → Ongoing → Finalizing → Done. The StatefulSet only shrinks once the
//! node reports it left the ring.

use super::Resync;
use super::children::update_pod_labels;
use super::pod_operation::PodOperations;
use crate::crd::{
    ActionStatus, CassandraCluster, CassandraClusterStatus, OperationName, dc_rack_name,
};
use crate::error::{OperatorError, OperatorResult};
use crate::node_control::{OPERATION_MODE_DECOMMISSIONED, OPERATION_MODE_NORMAL};
use crate::resources::{
    LABEL_OPERATION_NAME, LABEL_OPERATION_START, LABEL_OPERATION_STATUS, cassandra_pod_is_ready,
    dc_rack_labels, label_time, parse_label_time, pod_is_running, pod_label, pvc_name, sort_pods,
};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use std::collections::BTreeMap;

impl<S: ObjectStore> PodOperations<S> {
    /// Drive the decommission of the last pod of a rack.
    ///
    /// An error always means the StatefulSet must be left alone.
    pub(super) async fn ensure_decommission(
        &self,
        cc: &CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
    ) -> OperatorResult<Resync> {
        let dc_rack = dc_rack_name(dc, rack);
        let cluster = cc.name_any();
        let op = &status
            .cassandra_rack_status
            .entry(dc_rack.clone())
            .or_default()
            .pod_last_operation;
        let (name, state, has_ok) = (op.name, op.status, !op.pods_ok.is_empty());

        if name != Some(OperationName::Decommission) {
            tracing::warn!(cluster = %cluster, dc_rack = %dc_rack, operation = ?name, "Scale down without a decommission operation");
            return Ok(Resync::Continue);
        }

        match state {
            Some(ActionStatus::ToDo) => self.decommission_todo(cc, status, dc, rack).await,
            Some(ActionStatus::Ongoing | ActionStatus::Finalizing) => {
                self.decommission_ongoing(cc, status, &dc_rack).await
            }
            Some(ActionStatus::Done) => {
                if !has_ok {
                    return Err(OperatorError::ValidationError(format!(
                        "decommission of {dc_rack} is Done without any pod in podsOK"
                    )));
                }
                if let Some(rack) = status.cassandra_rack_status.get_mut(&dc_rack) {
                    rack.cassandra_last_action.status = Some(ActionStatus::Continue);
                }
                Ok(Resync::Break)
            }
            other => {
                tracing::error!(cluster = %cluster, dc_rack = %dc_rack, status = ?other, "Unexpected decommission status");
                Ok(Resync::Continue)
            }
        }
    }

    /// Label the last pod and start the decommission RPC.
    async fn decommission_todo(
        &self,
        cc: &CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
    ) -> OperatorResult<Resync> {
        let dc_rack = dc_rack_name(dc, rack);
        let cluster = cc.name_any();
        let namespace = cc.namespace().unwrap_or_default();

        let mut pods: Vec<Pod> = self.ctx.store.list(&namespace, &dc_rack_labels(cc, dc, rack)).await?;
        sort_pods(&mut pods);
        let last = pods
            .pop()
            .ok_or_else(|| OperatorError::ValidationError(format!("no pod to decommission in {dc_rack}")))?;
        if !pod_is_running(&last) {
            return Err(OperatorError::ValidationError(format!(
                "last pod {} of {dc_rack} is not running",
                last.name_any()
            )));
        }
        let pod_name = last.name_any();
        tracing::info!(cluster = %cluster, dc_rack = %dc_rack, pod = %pod_name, "Scale down detected, decommissioning");

        let labels: BTreeMap<String, String> = [
            (LABEL_OPERATION_STATUS.to_string(), ActionStatus::Ongoing.as_str().to_string()),
            (LABEL_OPERATION_START.to_string(), label_time(self.ctx.now())),
            (LABEL_OPERATION_NAME.to_string(), OperationName::Decommission.as_str().to_string()),
        ]
        .into();
        if let Err(e) = update_pod_labels(self.ctx.store.as_ref(), &namespace, &pod_name, &labels).await {
            tracing::warn!(cluster = %cluster, pod = %pod_name, error = %e, "Cannot label pod");
        }

        let op = &mut status
            .cassandra_rack_status
            .entry(dc_rack.clone())
            .or_default()
            .pod_last_operation;
        op.status = Some(ActionStatus::Ongoing);
        op.pods = vec![pod_name.clone()];
        op.pods_ok.clear();
        op.pods_ko.clear();

        let nodes = self.ctx.nodes.clone();
        let cc = cc.clone();
        self.spawn(async move {
            tracing::debug!(pod = %pod_name, "Node decommission starts");
            let result = match nodes.connect(&cc, &last).await {
                Ok(node) => node.decommission().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => tracing::info!(cluster = %cc.name_any(), pod = %pod_name, "Node decommission ended"),
                Err(e) => tracing::warn!(cluster = %cc.name_any(), pod = %pod_name, error = %e, "Node decommission failed"),
            }
        });
        Ok(Resync::Break)
    }

    /// Follow the node until it left the ring.
    async fn decommission_ongoing(
        &self,
        cc: &CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc_rack: &str,
    ) -> OperatorResult<Resync> {
        let cluster = cc.name_any();
        let namespace = cc.namespace().unwrap_or_default();
        let now = self.ctx.now();
        let op = &mut status
            .cassandra_rack_status
            .entry(dc_rack.to_string())
            .or_default()
            .pod_last_operation;

        let Some(pod_name) = op.pods.first().filter(|p| !p.is_empty()).cloned() else {
            return Err(OperatorError::ValidationError(format!(
                "decommission of {dc_rack} is in progress without a pod"
            )));
        };

        let pod: Pod = match self.ctx.store.get(&namespace, &pod_name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                let pvc = pvc_name(&pod_name);
                match self.ctx.store.delete::<PersistentVolumeClaim>(&namespace, &pvc, None).await {
                    Ok(()) => tracing::info!(cluster = %cluster, pvc = %pvc, "PVC of decommissioned node deleted"),
                    Err(e) => tracing::error!(cluster = %cluster, pvc = %pvc, error = %e, "Cannot delete PVC, manual action required"),
                }
                op.status = Some(ActionStatus::Done);
                op.pods_ok = vec![pod_name];
                op.pods.clear();
                op.end_time = Some(now);
                return Ok(Resync::Break);
            }
            Err(e) => return Err(e),
        };

        if !cassandra_pod_is_ready(&pod) && pod.metadata.deletion_timestamp.is_some() {
            tracing::info!(cluster = %cluster, pod = %pod_name, "Pod is terminating, waiting");
            return Ok(Resync::Break);
        }

        let node = self.ctx.nodes.connect(cc, &pod).await?;
        let mode = node.operation_mode().await?;
        match mode.as_str() {
            OPERATION_MODE_NORMAL => {
                let started = pod_label(&pod, LABEL_OPERATION_START).and_then(parse_label_time);
                match started {
                    Some(start) if start + self.ctx.config.decommission_delay() > now => {
                        tracing::info!(cluster = %cluster, pod = %pod_name, "Decommission applied recently, waiting");
                    }
                    _ => {
                        tracing::info!(cluster = %cluster, pod = %pod_name, "Node still NORMAL, retrying decommission");
                        op.status = Some(ActionStatus::ToDo);
                    }
                }
                Ok(Resync::Break)
            }
            OPERATION_MODE_DECOMMISSIONED | "" => {
                tracing::info!(cluster = %cluster, pod = %pod_name, mode = %mode, "Node left the ring, waiting for the StatefulSet to shrink");
                op.status = Some(ActionStatus::Finalizing);
                Ok(Resync::Continue)
            }
            _ => {
                tracing::info!(cluster = %cluster, pod = %pod_name, mode = %mode, "Node is decommissioning, waiting");
                Ok(Resync::Break)
            }
        }
    }
}
