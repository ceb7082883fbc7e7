//! Create or update the StatefulSet of a rack.

use super::{ControllerContext, Resync};
use crate::crd::{ActionKind, ActionStatus, CassandraCluster, CassandraClusterStatus, dc_rack_name};
use crate::error::OperatorResult;
use crate::resources::{
    LABEL_ROLLING_RESTART, build_statefulset, dc_rack_labels, label_time, pod_is_running,
    set_seed_env, sort_pods, statefulsets_are_equal, stored_seed_env,
};
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::time::Instant;

fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

fn set_replicas(sts: &mut StatefulSet, value: i32) {
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = Some(value);
    }
}

/// Whether a node of the rack reports nodes still joining the ring.
///
/// Any failure counts as joining.
async fn nodes_are_joining<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    dc: &str,
    rack: &str,
) -> bool {
    let namespace = cc.namespace().unwrap_or_default();
    let mut pods: Vec<Pod> = match ctx.store.list(&namespace, &dc_rack_labels(cc, dc, rack)).await {
        Ok(pods) => pods,
        Err(e) => {
            tracing::warn!(cluster = %cc.name_any(), dc, rack, error = %e, "Cannot list pods before scaling up");
            return true;
        }
    };
    sort_pods(&mut pods);
    let Some(pod) = pods.iter().find(|p| pod_is_running(p)) else {
        return false;
    };
    let joining = match ctx.nodes.connect(cc, pod).await {
        Ok(node) => node.joining_nodes().await,
        Err(e) => Err(e),
    };
    match joining {
        Ok(nodes) if nodes.is_empty() => false,
        Ok(nodes) => {
            tracing::info!(cluster = %cc.name_any(), dc, rack, joining = ?nodes, "Nodes are joining, scale up deferred");
            true
        }
        Err(e) => {
            tracing::warn!(cluster = %cc.name_any(), pod = %pod.name_any(), error = %e, "Cannot list joining nodes");
            true
        }
    }
}

/// Bring the stored StatefulSet of `dc`/`rack` toward the cluster spec.
///
/// Returns [`Resync::Break`] after a create or an update so the next rack
/// waits for this one.
pub(super) async fn ensure_statefulset<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc: &str,
    rack: &str,
    no_disruption: bool,
) -> OperatorResult<Resync> {
    let dc_rack = dc_rack_name(dc, rack);
    let namespace = cc.namespace().unwrap_or_default();
    let cluster = cc.name_any();
    let now = ctx.now();
    let mut desired = build_statefulset(cc, status, dc, rack);
    let name = desired.name_any();

    let stored = match ctx.store.get::<StatefulSet>(&namespace, &name).await {
        Ok(stored) => stored,
        Err(e) if e.is_not_found() => {
            match ctx.store.create(&namespace, &desired).await {
                Ok(_) => tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Created StatefulSet"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
            return Ok(Resync::Break);
        }
        Err(e) => return Err(e),
    };

    if !no_disruption {
        if cc.spec.unlock_next_operation {
            tracing::warn!(cluster = %cluster, dc_rack = %dc_rack, "Disruption in progress but the next operation is unlocked");
        } else {
            tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Disruption in progress, StatefulSet left untouched");
            return Ok(Resync::Continue);
        }
    }

    desired.metadata.resource_version = stored.resource_version();
    let stored_template_labels = stored
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone());
    if let Some(meta) = desired.spec.as_mut().and_then(|s| s.template.metadata.as_mut()) {
        meta.labels = stored_template_labels;
    }

    let rack_status = status.cassandra_rack_status.entry(dc_rack.clone()).or_default();
    let action = &mut rack_status.cassandra_last_action;

    if action.is(ActionKind::UpdateSeedList, ActionStatus::ToDo) {
        tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Update seed list on rack");
        action.status = Some(ActionStatus::Ongoing);
        action.start_time = Some(now);
    } else if let Some(seeds) = stored_seed_env(&stored) {
        set_seed_env(&mut desired, &seeds);
    }

    let current = replicas(&stored);
    let wanted = replicas(&desired);
    if (wanted - current).abs() > 1 {
        let step = if wanted > current { current + 1 } else { current - 1 };
        tracing::debug!(cluster = %cluster, dc_rack = %dc_rack, wanted, step, "Scaling one node at a time");
        set_replicas(&mut desired, step);
    }
    if replicas(&desired) > current && nodes_are_joining(ctx, cc, dc, rack).await {
        set_replicas(&mut desired, current);
    }

    // Re-borrow: the joining probe above needed `ctx` only.
    let action = &mut status
        .cassandra_rack_status
        .entry(dc_rack.clone())
        .or_default()
        .cassandra_last_action;

    if action.is(ActionKind::RollingRestart, ActionStatus::ToDo) {
        if let Some(meta) = desired.spec.as_mut().and_then(|s| s.template.metadata.as_mut()) {
            meta.labels
                .get_or_insert_with(Default::default)
                .insert(LABEL_ROLLING_RESTART.into(), label_time(now));
        }
        action.status = Some(ActionStatus::Ongoing);
        action.start_time = Some(now);
    }

    if !cc.spec.no_check_sts_are_equal && statefulsets_are_equal(&stored, &desired) {
        tracing::debug!(cluster = %cluster, dc_rack = %dc_rack, "StatefulSets are equal, no update");
        return Ok(Resync::Continue);
    }

    if action.status == Some(ActionStatus::ToDo) {
        action.status = Some(ActionStatus::Ongoing);
        action.start_time = Some(now);
        action.end_time = None;
    }
    if !cc.spec.no_check_sts_are_equal && action.status == Some(ActionStatus::Done) {
        tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Start updating StatefulSet");
        action.name = Some(ActionKind::UpdateStatefulSet);
        action.status = Some(ActionStatus::Ongoing);
        action.start_time = Some(now);
        action.end_time = None;
    }

    let previous = stored.resource_version();
    ctx.store.update(&namespace, &desired).await?;
    tracing::info!(cluster = %cluster, dc_rack = %dc_rack, replicas = replicas(&desired), "StatefulSet updated");
    wait_for_new_version(ctx, &namespace, &name, previous).await;
    Ok(Resync::Break)
}

/// Poll until the stored resourceVersion moves, bounded by the configured timeout.
async fn wait_for_new_version<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    namespace: &str,
    name: &str,
    previous: Option<String>,
) {
    let started = Instant::now();
    loop {
        match ctx.store.get::<StatefulSet>(namespace, name).await {
            Ok(sts) if sts.resource_version() != previous => return,
            Ok(_) => {}
            Err(e) => tracing::debug!(statefulset = %name, error = %e, "Waiting for StatefulSet update"),
        }
        if started.elapsed() >= ctx.config.sts_update_timeout() {
            tracing::warn!(statefulset = %name, "StatefulSet update not visible yet");
            return;
        }
        tokio::time::sleep(ctx.config.sts_update_poll()).await;
    }
}
