//! Objects around the StatefulSets: Services, PodDisruptionBudget, PVCs,
//! pod labels and the PVC finalizer.

use super::ControllerContext;
use crate::crd::CassandraCluster;
use crate::error::OperatorResult;
use crate::resources::{
    FINALIZER_DELETE_PVC, build_dc_rack_service, build_dc_service, build_exporter_service,
    build_pod_disruption_budget, dc_rack_labels, dc_service_name, exporter_service_name,
    pod_is_running, statefulset_name,
};
use crate::store::{ObjectStore, StoreObject};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

async fn create_if_missing<S: ObjectStore, K: StoreObject>(store: &S, namespace: &str, obj: &K) -> OperatorResult<()> {
    match store.get::<K>(namespace, &obj.name_any()).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => match store.create(namespace, obj).await {
            Ok(_) => {
                tracing::info!(kind = %K::kind(&()), name = %obj.name_any(), "Created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Create the rack, DC and exporter Services when missing.
pub(super) async fn ensure_services<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    dc: &str,
    rack: &str,
) -> OperatorResult<()> {
    let namespace = cc.namespace().unwrap_or_default();
    create_if_missing(ctx.store.as_ref(), &namespace, &build_dc_rack_service(cc, dc, rack)).await?;
    create_if_missing(ctx.store.as_ref(), &namespace, &build_dc_service(cc, dc)).await?;
    create_if_missing(ctx.store.as_ref(), &namespace, &build_exporter_service(cc, dc)).await
}

/// Ensure the budget exists with the wanted maxUnavailable.
///
/// Returns `true` when the stored budget still allows a disruption.
pub(super) async fn ensure_pod_disruption_budget<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
) -> OperatorResult<bool> {
    let namespace = cc.namespace().unwrap_or_default();
    let wanted = build_pod_disruption_budget(cc);
    let stored = match ctx.store.get::<PodDisruptionBudget>(&namespace, &cc.name_any()).await {
        Ok(stored) => stored,
        Err(e) if e.is_not_found() => {
            ctx.store.create(&namespace, &wanted).await?;
            tracing::info!(cluster = %cc.name_any(), "Created PodDisruptionBudget");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let max_unavailable = |pdb: &PodDisruptionBudget| {
        pdb.spec
            .as_ref()
            .and_then(|s| s.max_unavailable.clone())
            .unwrap_or(IntOrString::Int(0))
    };
    if max_unavailable(&stored) != max_unavailable(&wanted) {
        // maxUnavailable cannot be patched in place on every API version.
        tracing::info!(cluster = %cc.name_any(), "maxPodUnavailable changed, recreating PodDisruptionBudget");
        ctx.store
            .delete::<PodDisruptionBudget>(&namespace, &cc.name_any(), None)
            .await?;
        ctx.store.create(&namespace, &wanted).await?;
        return Ok(false);
    }

    Ok(stored
        .status
        .as_ref()
        .is_some_and(|s| s.disruptions_allowed > 0))
}

/// Delete every PVC of a rack.
pub(super) async fn delete_rack_pvcs<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    dc: &str,
    rack: &str,
) {
    let namespace = cc.namespace().unwrap_or_default();
    let pvcs = match ctx
        .store
        .list::<PersistentVolumeClaim>(&namespace, &dc_rack_labels(cc, dc, rack))
        .await
    {
        Ok(pvcs) => pvcs,
        Err(e) => {
            tracing::error!(cluster = %cc.name_any(), dc, rack, error = %e, "Cannot list PVCs");
            return;
        }
    };
    for pvc in pvcs {
        match ctx
            .store
            .delete::<PersistentVolumeClaim>(&namespace, &pvc.name_any(), None)
            .await
        {
            Ok(()) => tracing::info!(cluster = %cc.name_any(), pvc = %pvc.name_any(), "PVC deleted"),
            Err(e) => tracing::error!(
                cluster = %cc.name_any(),
                pvc = %pvc.name_any(),
                error = %e,
                "Cannot delete PVC, manual action required"
            ),
        }
    }
}

/// Delete the StatefulSet and Services of racks removed with their DC.
pub(super) async fn delete_dc_objects<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    removed_dc: &str,
    removed: &[String],
) {
    let namespace = cc.namespace().unwrap_or_default();
    for dc_rack in removed {
        let sts = statefulset_name(cc, dc_rack);
        if let Err(e) = ctx.store.delete::<StatefulSet>(&namespace, &sts, None).await {
            if !e.is_not_found() {
                tracing::warn!(cluster = %cc.name_any(), dc_rack = %dc_rack, error = %e, "Cannot delete StatefulSet");
            }
        }

        let dc = CassandraCluster::dc_from_dc_rack_name(dc_rack, &[removed_dc]);
        for name in [dc_service_name(cc, dc), sts, exporter_service_name(cc, dc)] {
            if let Err(e) = ctx.store.delete::<Service>(&namespace, &name, None).await {
                if !e.is_not_found() {
                    tracing::warn!(cluster = %cc.name_any(), service = %name, error = %e, "Cannot delete Service");
                }
            }
        }
    }
}

/// Merge `labels` into the labels of a pod.
pub(crate) async fn update_pod_labels<S: ObjectStore>(
    store: &S,
    namespace: &str,
    pod_name: &str,
    labels: &BTreeMap<String, String>,
) -> OperatorResult<()> {
    let mut pod: Pod = store.get(namespace, pod_name).await?;
    pod.labels_mut().extend(labels.clone());
    store.update(namespace, &pod).await?;
    Ok(())
}

/// Merge `labels` into every running pod of a rack.
pub(super) async fn label_rack_pods<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    dc: &str,
    rack: &str,
    labels: &BTreeMap<String, String>,
) {
    let namespace = cc.namespace().unwrap_or_default();
    let pods = match ctx.store.list::<Pod>(&namespace, &dc_rack_labels(cc, dc, rack)).await {
        Ok(pods) => pods,
        Err(e) => {
            tracing::error!(cluster = %cc.name_any(), dc, rack, error = %e, "Cannot list pods");
            return;
        }
    };
    for pod in pods.iter().filter(|p| pod_is_running(p)) {
        match update_pod_labels(ctx.store.as_ref(), &namespace, &pod.name_any(), labels).await {
            Ok(()) => tracing::info!(cluster = %cc.name_any(), pod = %pod.name_any(), ?labels, "Pod labels updated"),
            Err(e) => tracing::error!(cluster = %cc.name_any(), pod = %pod.name_any(), error = %e, "Cannot update pod labels"),
        }
    }
}

/// Add or remove the PVC finalizer. Returns whether the list changed.
pub(super) fn set_pvc_finalizer(cc: &mut CassandraCluster, enabled: bool) -> bool {
    let finalizers = cc.finalizers_mut();
    let present = finalizers.iter().any(|f| f == FINALIZER_DELETE_PVC);
    match (enabled, present) {
        (true, false) => {
            tracing::info!("PVCs will be deleted with the cluster");
            finalizers.push(FINALIZER_DELETE_PVC.to_string());
            true
        }
        (false, true) => {
            tracing::info!("PVCs will be kept when the cluster is deleted");
            finalizers.retain(|f| f != FINALIZER_DELETE_PVC);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CassandraClusterSpec;

    #[test]
    fn finalizer_follows_delete_pvc() {
        let mut cc = CassandraCluster::new("c", CassandraClusterSpec::default());
        assert!(set_pvc_finalizer(&mut cc, true));
        assert!(!set_pvc_finalizer(&mut cc, true));
        assert_eq!(cc.finalizers(), [FINALIZER_DELETE_PVC.to_string()]);
        assert!(set_pvc_finalizer(&mut cc, false));
        assert!(cc.finalizers().is_empty());
    }
}
