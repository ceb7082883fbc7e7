//! Rack and cluster status transitions.
//!
//! Everything here works on values: the working copy of the cluster status and
//! a [`RackView`] of the observed StatefulSet and pods. Side effects the
//! caller must perform are returned as [`RackEffect`]s.

use crate::crd::topology::contains_all;
use crate::crd::{
    ActionKind, ActionStatus, CassandraCluster, CassandraClusterStatus, ClusterPhase,
    OperationName, PodLastOperation, RackStatus, merge_seed_list,
};
use crate::resources::{cassandra_image, cassandra_pod_is_ready, stored_seed_list};
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// What the reconcile pass observed for one rack.
pub struct RackView<'a> {
    /// Stored StatefulSet of the rack.
    pub sts: &'a StatefulSet,
    /// Pods of the rack, sorted by ordinal.
    pub pods: &'a [Pod],
    /// The PodDisruptionBudget still allows a disruption.
    pub no_disruption: bool,
    /// Time of the pass.
    pub now: DateTime<Utc>,
}

/// Work left to the caller after a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RackEffect {
    /// Label the running pods of the rack `operation-name=cleanup` with the given status.
    LabelPodsForCleanup(ActionStatus),
    /// Reset the rack's `rollingRestart` flag in the spec.
    ClearRollingRestart,
}

fn spec_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

fn observed_replicas(sts: &StatefulSet) -> i32 {
    sts.status.as_ref().map_or(0, |s| s.replicas)
}

/// Every requested replica reports ready.
pub fn statefulset_ready(sts: &StatefulSet) -> bool {
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == spec_replicas(sts)
}

fn revisions_match(sts: &StatefulSet) -> bool {
    let status = sts.status.as_ref();
    status.and_then(|s| s.current_revision.as_deref())
        == status.and_then(|s| s.update_revision.as_deref())
}

fn rack_mut<'a>(status: &'a mut CassandraClusterStatus, dc_rack: &str) -> &'a mut RackStatus {
    status
        .cassandra_rack_status
        .entry(dc_rack.to_string())
        .or_default()
}

/// Derive the rack phase: Initializing → Running ↔ Pending.
pub fn update_rack_phase(
    cc: &CassandraCluster,
    dc_rack: &str,
    rack: &mut RackStatus,
    view: &RackView<'_>,
) {
    let desired = cc.nodes_per_racks(dc_rack);
    let cluster = cc.name_any();

    if rack.phase != ClusterPhase::Initializing {
        if !statefulset_ready(view.sts) {
            if rack.phase != ClusterPhase::Pending {
                tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Rack replicas are not all ready");
            }
            rack.phase = ClusterPhase::Pending;
        } else if rack.phase != ClusterPhase::Running {
            tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Rack replicas are ready");
            rack.phase = ClusterPhase::Running;
        }
        return;
    }

    if desired == 0 {
        rack.phase = ClusterPhase::Running;
        if spec_replicas(view.sts) > 0 {
            tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Rack asked for 0 nodes while initializing, scaling down");
            rack.cassandra_last_action.set(ActionKind::ScaleDown, ActionStatus::ToDo);
            rack.pod_last_operation = PodLastOperation {
                name: Some(OperationName::Decommission),
                status: Some(ActionStatus::ToDo),
                start_time: Some(view.now),
                operator_name: std::mem::take(&mut rack.pod_last_operation.operator_name),
                ..Default::default()
            };
        } else {
            rack.cassandra_last_action.status = Some(ActionStatus::Done);
            rack.cassandra_last_action.end_time = Some(view.now);
        }
        return;
    }

    if !statefulset_ready(view.sts) {
        tracing::debug!(cluster = %cluster, dc_rack = %dc_rack, "Initializing rack is waiting for its replicas");
        return;
    }
    let Some(last) = view.pods.get(desired as usize - 1) else {
        tracing::debug!(cluster = %cluster, dc_rack = %dc_rack, "Initializing rack is waiting for its pods");
        return;
    };
    if cassandra_pod_is_ready(last) {
        tracing::info!(cluster = %cluster, dc_rack = %dc_rack, "Rack initialized");
        rack.phase = ClusterPhase::Running;
        rack.cassandra_last_action.status = Some(ActionStatus::Done);
        rack.cassandra_last_action.end_time = Some(view.now);
    }
}

/// Find the next action of a rack, or notice the end of the current one.
///
/// Only one change is picked per call. `delay_wait` is the grace window
/// during which a freshly started action is left alone.
pub fn next_rack_status(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
    delay_wait: Duration,
) -> Vec<RackEffect> {
    let mut effects = Vec::new();
    let Some(rack) = status.cassandra_rack_status.get(dc_rack) else {
        return effects;
    };

    if let Some(start) = rack.cassandra_last_action.start_time {
        if start + delay_wait > view.now {
            tracing::info!(
                cluster = %cc.name_any(),
                dc_rack = %dc_rack,
                wait_secs = delay_wait.num_seconds(),
                "Waiting for the action to settle before checking it"
            );
            return effects;
        }
    }

    if action_ended(cc, status, dc_rack, view, &mut effects) {
        return effects;
    }

    let rack = rack_mut(status, dc_rack);
    if rack.phase == ClusterPhase::Initializing {
        return effects;
    }

    let busy = rack.cassandra_last_action.status_in(&[
        ActionStatus::Ongoing,
        ActionStatus::ToDo,
        ActionStatus::Finalizing,
    ]);
    if (view.no_disruption || cc.spec.unlock_next_operation) && !busy {
        if config_map_changed(cc, status, dc_rack, view)
            || image_changed(cc, status, dc_rack, view)
            || scaling(cc, status, dc_rack, view)
            || seed_list_changed(cc, status, dc_rack, view)
            || rolling_restart(cc, status, dc_rack, &mut effects)
            || statefulset_changed(status, dc_rack, view)
        {
            return effects;
        }
    } else {
        tracing::info!(
            cluster = %cc.name_any(),
            dc_rack = %dc_rack,
            "No new action until the cluster is stable again"
        );
    }

    let action = &mut rack_mut(status, dc_rack).cassandra_last_action;
    if action.is(ActionKind::UpdateResources, ActionStatus::ToDo) {
        action.status = Some(ActionStatus::Ongoing);
        action.start_time = Some(view.now);
    }
    effects
}

fn action_ended(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
    effects: &mut Vec<RackEffect>,
) -> bool {
    let desired = cc.nodes_per_racks(dc_rack);
    let rack = rack_mut(status, dc_rack);
    let action = &mut rack.cassandra_last_action;
    if !action.status_in(&[ActionStatus::Ongoing, ActionStatus::Continue]) {
        return false;
    }

    let done = match action.name {
        Some(ActionKind::ScaleUp) => {
            desired >= 1
                && desired == observed_replicas(view.sts)
                && view
                    .pods
                    .get(desired as usize - 1)
                    .is_some_and(cassandra_pod_is_ready)
        }
        Some(ActionKind::ScaleDown) => {
            let ended = desired == observed_replicas(view.sts)
                && rack
                    .pod_last_operation
                    .is(OperationName::Decommission, ActionStatus::Done);
            if !ended && desired == observed_replicas(view.sts) {
                tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "ScaleDown waits for the decommission to be done");
            }
            ended
        }
        Some(ActionKind::Initializing) => false,
        _ => revisions_match(view.sts),
    };
    if !done {
        return false;
    }

    let action = &mut rack.cassandra_last_action;
    tracing::info!(
        cluster = %cc.name_any(),
        dc_rack = %dc_rack,
        action = ?action.name,
        "Action is done"
    );
    action.status = Some(ActionStatus::Done);
    action.end_time = Some(view.now);
    if action.name == Some(ActionKind::ScaleUp) {
        let cleanup = if cc.spec.auto_pilot {
            ActionStatus::ToDo
        } else {
            ActionStatus::Manual
        };
        effects.push(RackEffect::LabelPodsForCleanup(cleanup));
    }
    true
}

fn schedule(status: &mut CassandraClusterStatus, dc_rack: &str, kind: ActionKind, state: ActionStatus) {
    rack_mut(status, dc_rack).cassandra_last_action.set(kind, state);
}

fn config_map_changed(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
) -> bool {
    let stored = view
        .sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.volumes.as_ref())
        .and_then(|v| v.first())
        .and_then(|v| v.config_map.as_ref())
        .map(|c| c.name.as_str());
    let wanted = cc.config_map_name();
    if stored == wanted {
        return false;
    }
    tracing::info!(
        cluster = %cc.name_any(),
        dc_rack = %dc_rack,
        wanted = wanted.unwrap_or("-"),
        stored = stored.unwrap_or("-"),
        "ConfigMap changed"
    );
    schedule(status, dc_rack, ActionKind::UpdateConfigMap, ActionStatus::ToDo);
    true
}

fn image_changed(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
) -> bool {
    let Some(stored) = view
        .sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
    else {
        return false;
    };
    let wanted = cassandra_image(&cc.spec);
    if stored.image.as_deref() == Some(wanted.as_str()) {
        return false;
    }
    tracing::info!(
        cluster = %cc.name_any(),
        dc_rack = %dc_rack,
        wanted = %wanted,
        stored = stored.image.as_deref().unwrap_or("-"),
        "Docker image changed"
    );
    schedule(status, dc_rack, ActionKind::UpdateDockerImage, ActionStatus::ToDo);
    true
}

fn scaling(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
) -> bool {
    let desired = cc.nodes_per_racks(dc_rack);
    let current = spec_replicas(view.sts);
    if desired == current {
        return false;
    }

    let rack = rack_mut(status, dc_rack);
    if desired > current {
        tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, desired, current, "ScaleUp");
        rack.cassandra_last_action.set(ActionKind::ScaleUp, ActionStatus::ToDo);
    } else {
        tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, desired, current, "ScaleDown");
        rack.cassandra_last_action.set(ActionKind::ScaleDown, ActionStatus::ToDo);
        let op = &mut rack.pod_last_operation;
        op.name = Some(OperationName::Decommission);
        op.status = Some(ActionStatus::ToDo);
        op.start_time = Some(view.now);
        op.end_time = None;
        op.pods.clear();
        op.pods_ok.clear();
        op.pods_ko.clear();
    }
    true
}

fn seed_list_changed(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    view: &RackView<'_>,
) -> bool {
    let stored = stored_seed_list(view.sts);

    if cc.spec.auto_update_seed_list {
        let wanted = cc.init_seed_list();
        if !contains_all(&wanted, &stored) || !contains_all(&stored, &wanted) {
            status.seedlist = merge_seed_list(&stored, &wanted);
            tracing::info!(
                cluster = %cc.name_any(),
                dc_rack = %dc_rack,
                stored = ?stored,
                seeds = ?status.seedlist,
                "Seed list needs an update"
            );
        }
    }

    if status.seedlist == stored {
        return false;
    }
    tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Seed list changed");
    schedule(status, dc_rack, ActionKind::UpdateSeedList, ActionStatus::Configuring);
    true
}

fn rolling_restart(
    cc: &CassandraCluster,
    status: &mut CassandraClusterStatus,
    dc_rack: &str,
    effects: &mut Vec<RackEffect>,
) -> bool {
    if !cc.rolling_restart(dc_rack) {
        return false;
    }
    tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, "Rolling restart requested");
    schedule(status, dc_rack, ActionKind::RollingRestart, ActionStatus::ToDo);
    effects.push(RackEffect::ClearRollingRestart);
    true
}

fn statefulset_changed(status: &mut CassandraClusterStatus, dc_rack: &str, view: &RackView<'_>) -> bool {
    if revisions_match(view.sts) {
        return false;
    }
    let action = &mut rack_mut(status, dc_rack).cassandra_last_action;
    action.name = Some(ActionKind::UpdateStatefulSet);
    action.status = Some(ActionStatus::Ongoing);
    action.start_time = Some(view.now);
    action.end_time = None;
    true
}

/// Mirror the rack states onto the cluster status.
///
/// The first rack whose action is not Done gives the cluster action and the
/// first rack that is not Running gives the cluster phase.
pub fn update_cluster_phase(cc: &CassandraCluster, status: &mut CassandraClusterStatus) {
    let mut pending_action = false;
    for (dc, rack) in cc.dc_rack_pairs() {
        let key = format!("{dc}-{rack}");
        let Some(rack_status) = status.cassandra_rack_status.get(&key) else {
            continue;
        };
        let action = rack_status.cassandra_last_action.clone();
        let phase = rack_status.phase;

        if action.status != Some(ActionStatus::Done) && !pending_action {
            status.last_cluster_action = action.name;
            status.last_cluster_action_status = action.status;
            pending_action = true;
        }

        if phase != ClusterPhase::Running {
            status.phase = Some(phase);
            return;
        }
    }

    if !pending_action && status.last_cluster_action_status != Some(ActionStatus::Done) {
        tracing::info!(cluster = %cc.name_any(), action = ?status.last_cluster_action, "Cluster action is done");
        status.last_cluster_action_status = Some(ActionStatus::Done);
        status.phase = Some(ClusterPhase::Running);
    }
    if status.phase != Some(ClusterPhase::Running)
        && status.last_cluster_action_status == Some(ActionStatus::Done)
    {
        status.phase = Some(ClusterPhase::Running);
    }
}

/// Start a seed list update once every rack is ready for it.
///
/// Returns whether the racks were flipped to `UpdateSeedList/ToDo`.
pub fn flip_seed_list_status(cc: &CassandraCluster, status: &mut CassandraClusterStatus) -> bool {
    if status.last_cluster_action != Some(ActionKind::UpdateSeedList)
        || status.last_cluster_action_status != Some(ActionStatus::Configuring)
    {
        return false;
    }

    let keys: Vec<String> = cc
        .dc_rack_pairs()
        .iter()
        .map(|(dc, rack)| format!("{dc}-{rack}"))
        .collect();
    let all_ready = keys.iter().all(|key| {
        status.cassandra_rack_status.get(key).is_some_and(|r| {
            let action = &r.cassandra_last_action;
            action.is(ActionKind::UpdateSeedList, ActionStatus::Configuring)
                || action.name == Some(ActionKind::Initializing)
        })
    });
    if !all_ready {
        return false;
    }

    for key in &keys {
        if let Some(rack) = status.cassandra_rack_status.get_mut(key) {
            tracing::info!(cluster = %cc.name_any(), dc_rack = %key, "UpdateSeedList=ToDo");
            rack.cassandra_last_action.name = Some(ActionKind::UpdateSeedList);
            rack.cassandra_last_action.status = Some(ActionStatus::ToDo);
        }
    }
    true
}
