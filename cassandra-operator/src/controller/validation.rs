//! Rejection of spec changes the StatefulSets cannot follow.
//!
//! The last-applied annotation is the baseline. [`check_non_allowed_changes`]
//! compares the new spec with it and returns a corrected spec together with
//! the outcome; it performs no I/O so the controller gathers the data probe
//! for a DC scaled to zero beforehand.

use crate::crd::{ActionKind, ActionStatus, CassandraCluster, CassandraClusterSpec, CassandraClusterStatus};
use kube::ResourceExt;

/// Replication probe of the DC asked to scale to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcDataCheck {
    /// The first rack of the DC has no pod.
    NoPods,
    /// No keyspace replicates data to the DC.
    NoData,
    /// Keyspaces still replicating data to the DC.
    HasData(Vec<String>),
    /// The probe could not be answered.
    Unverifiable(String),
}

/// Whether the change is held back, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// The change must not reach the StatefulSets this pass.
    pub blocked: bool,
    /// Action recorded as the last cluster action.
    pub reason: Option<ActionKind>,
}

impl ValidationOutcome {
    fn block(&mut self, reason: ActionKind) {
        self.blocked = true;
        self.reason.get_or_insert(reason);
    }
}

/// Result of [`check_non_allowed_changes`].
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Spec with forbidden changes reverted.
    pub spec: CassandraClusterSpec,
    /// Outcome folded over every rule.
    pub outcome: ValidationOutcome,
    /// DC whose objects must be deleted.
    pub removed_dc: Option<String>,
    /// Container resources changed; every rack gets an UpdateResources action.
    pub update_resources: bool,
}

/// Parse the last-applied annotation when it differs from the current spec.
///
/// Returns `None` when there is nothing to validate against.
pub fn last_applied(cc: &CassandraCluster) -> Option<CassandraCluster> {
    let stored = cc.stored_last_applied()?;
    match cc.last_applied_configuration() {
        Ok(current) if current == stored => return None,
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(cluster = %cc.name_any(), error = %e, "Cannot render the last applied configuration");
        }
    }
    match serde_json::from_str(stored) {
        Ok(old) => Some(old),
        Err(e) => {
            tracing::error!(cluster = %cc.name_any(), error = %e, "Cannot parse the last applied configuration");
            None
        }
    }
}

/// Compare `cc` with its last-applied configuration `old`.
///
/// `data_check` answers the replication probe when a DC asks for 0 nodes;
/// `None` means it was not gathered.
pub fn check_non_allowed_changes(
    cc: &CassandraCluster,
    old: &CassandraCluster,
    status: &CassandraClusterStatus,
    data_check: Option<&DcDataCheck>,
) -> Validation {
    let name = cc.name_any();
    let mut new = cc.clone();
    let mut validation = Validation {
        spec: cc.spec.clone(),
        outcome: ValidationOutcome::default(),
        removed_dc: None,
        update_resources: false,
    };

    if new.spec.nodes_per_racks == 0 {
        tracing::warn!(
            cluster = %name,
            restored = old.spec.nodes_per_racks,
            "Refused nodesPerRacks=0, restoring the previous value"
        );
        new.spec.nodes_per_racks = old.spec.nodes_per_racks;
        validation.outcome.block(ActionKind::CorrectCRDConfig);
    }

    for index in 0..new.dc_size() {
        let dc_name = new.spec.topology.dc[index].name.clone();
        if !old.is_valid_dc(&dc_name) {
            continue;
        }
        let old_dc = old.spec.topology.dc.iter().find(|d| d.name == dc_name);

        let (wanted, stored) = (new.data_capacity_for_dc(&dc_name), old.data_capacity_for_dc(&dc_name));
        if wanted != stored {
            tracing::warn!(cluster = %name, dc = %dc_name, %wanted, %stored, "Refused dataCapacity change");
            new.spec.data_capacity = old.spec.data_capacity.clone();
            new.spec.topology.dc[index].data_capacity = old_dc.and_then(|d| d.data_capacity.clone());
            validation.outcome.block(ActionKind::CorrectCRDConfig);
        }

        let (wanted, stored) = (
            new.data_storage_class_for_dc(&dc_name),
            old.data_storage_class_for_dc(&dc_name),
        );
        if wanted != stored {
            tracing::warn!(cluster = %name, dc = %dc_name, ?wanted, ?stored, "Refused dataStorageClass change");
            new.spec.data_storage_class = old.spec.data_storage_class.clone();
            new.spec.topology.dc[index].data_storage_class =
                old_dc.and_then(|d| d.data_storage_class.clone());
            validation.outcome.block(ActionKind::CorrectCRDConfig);
        }
    }

    if validation.outcome.blocked {
        validation.spec = new.spec;
        return validation;
    }

    match topology_change(&new, old, status) {
        TopologyChange::None => {}
        TopologyChange::Refused => {
            new.spec.topology = old.spec.topology.clone();
            validation.outcome.block(ActionKind::CorrectCRDConfig);
            validation.spec = new.spec;
            return validation;
        }
        TopologyChange::DeleteDc(dc) => {
            tracing::warn!(cluster = %name, dc = %dc, "Removing DC");
            validation.outcome.block(ActionKind::DeleteDC);
            validation.removed_dc = Some(dc);
            validation.spec = new.spec;
            return validation;
        }
    }

    if let Some((dc_name, _)) = new.find_dc_with_nodes_to_0() {
        let refused = match data_check {
            None => Some("no probe".to_string()),
            Some(DcDataCheck::NoPods) | Some(DcDataCheck::NoData) => None,
            Some(DcDataCheck::HasData(keyspaces)) => {
                Some(format!("keyspaces still have data: {}", keyspaces.join(",")))
            }
            Some(DcDataCheck::Unverifiable(reason)) => Some(reason.clone()),
        };
        match refused {
            Some(reason) => {
                tracing::warn!(cluster = %name, dc = %dc_name, %reason, "Refused scale down to 0");
                new.spec.topology = old.spec.topology.clone();
                validation.outcome.block(ActionKind::CorrectCRDConfig);
                validation.spec = new.spec;
                return validation;
            }
            None => {
                tracing::info!(cluster = %name, dc = %dc_name, "No more replicated data, scale down to 0 accepted");
            }
        }
    }

    if new.spec.resources != old.spec.resources {
        tracing::info!(cluster = %name, "Pod resources changed");
        validation.update_resources = true;
    }

    validation.spec = new.spec;
    validation
}

enum TopologyChange {
    None,
    Refused,
    DeleteDc(String),
}

fn topology_change(
    new: &CassandraCluster,
    old: &CassandraCluster,
    status: &CassandraClusterStatus,
) -> TopologyChange {
    let name = new.name_any();
    let new_dcs = new.dcs();
    let old_dcs = old.dcs();

    // Only whole DCs may come and go; DCs present on both sides keep their
    // name, token count and racks.
    for (new_dc, old_dc) in new_dcs.iter().zip(old_dcs) {
        let renamed_racks = new_dc.rack.len() != old_dc.rack.len()
            || new_dc
                .rack
                .iter()
                .zip(&old_dc.rack)
                .any(|(a, b)| a.name != b.name);
        if new_dc.name != old_dc.name || new_dc.num_tokens != old_dc.num_tokens || renamed_racks {
            tracing::warn!(
                cluster = %name,
                dc = %old_dc.name,
                "Refused topology change: only adding or removing a DC is allowed"
            );
            return TopologyChange::Refused;
        }
    }

    if new.dc_size() + 1 < old.dc_size() {
        tracing::warn!(cluster = %name, "Refused topology change: only one DC can be removed at a time");
        return TopologyChange::Refused;
    }

    if new.dc_rack_size() >= old.dc_rack_size() {
        return TopologyChange::None;
    }

    if status.last_cluster_action == Some(ActionKind::ScaleDown)
        && status.last_cluster_action_status != Some(ActionStatus::Done)
    {
        tracing::warn!(cluster = %name, "Refused DC removal: a ScaleDown is still running");
        return TopologyChange::Refused;
    }

    let Some(dc) = new.removed_dc_name(old) else {
        return TopologyChange::None;
    };
    if let (true, nodes) = old.dc_nodes_per_racks_from_name(&dc) {
        if nodes > 0 {
            tracing::warn!(cluster = %name, dc = %dc, nodes, "Refused DC removal: scale it down to 0 first");
            return TopologyChange::Refused;
        }
    }

    let mut remaining = status.clone();
    if new.fix_rack_list(&mut remaining).is_empty() {
        return TopologyChange::None;
    }
    TopologyChange::DeleteDc(dc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Dc, Rack, ResourceRequirements, ResourceSpec, Topology};
    use chrono::Utc;

    fn dc(name: &str, racks: &[&str], nodes: Option<i32>) -> Dc {
        Dc {
            name: name.into(),
            rack: racks
                .iter()
                .map(|r| Rack {
                    name: r.to_string(),
                    ..Default::default()
                })
                .collect(),
            nodes_per_racks: nodes,
            ..Default::default()
        }
    }

    fn cluster(nodes: i32, dcs: Vec<Dc>) -> CassandraCluster {
        let mut cc = CassandraCluster::new(
            "c",
            CassandraClusterSpec {
                nodes_per_racks: nodes,
                data_capacity: "3Gi".into(),
                topology: Topology { dc: dcs },
                ..Default::default()
            },
        );
        cc.metadata.namespace = Some("ns".into());
        cc
    }

    fn status_for(cc: &CassandraCluster) -> CassandraClusterStatus {
        let mut cc = cc.clone();
        cc.init_rack_status_list(Utc::now());
        cc.status.unwrap_or_default()
    }

    #[test]
    fn global_scale_to_zero_is_reverted() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let new = cluster(0, vec![dc("dc1", &["rack1"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(v.outcome.blocked);
        assert_eq!(v.outcome.reason, Some(ActionKind::CorrectCRDConfig));
        assert_eq!(v.spec.nodes_per_racks, 3);
    }

    #[test]
    fn validation_is_idempotent() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let mut new = cluster(0, vec![dc("dc1", &["rack1"], None)]);
        new.spec.data_capacity = "10Gi".into();
        let status = status_for(&old);

        let first = check_non_allowed_changes(&new, &old, &status, None);
        let second = check_non_allowed_changes(&new, &old, &status, None);
        assert_eq!(first, second);
        assert_eq!(first.spec.data_capacity, "3Gi");

        let mut corrected = new.clone();
        corrected.spec = first.spec;
        let again = check_non_allowed_changes(&corrected, &old, &status, None);
        assert!(!again.outcome.blocked);
    }

    #[test]
    fn per_dc_storage_class_change_is_reverted() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let mut new = old.clone();
        new.spec.topology.dc[0].data_storage_class = Some("fast".into());
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(v.outcome.blocked);
        assert_eq!(v.spec.topology.dc[0].data_storage_class, None);
    }

    #[test]
    fn rack_changes_restore_topology() {
        let old = cluster(3, vec![dc("dc1", &["rack1", "rack2"], None)]);
        let new = cluster(3, vec![dc("dc1", &["rack1", "rack3"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(v.outcome.blocked);
        assert_eq!(v.spec.topology, old.spec.topology);

        let new = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert_eq!(v.spec.topology, old.spec.topology);
    }

    #[test]
    fn adding_a_dc_is_allowed() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let new = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(!v.outcome.blocked);
        assert_eq!(v.spec, new.spec);
    }

    #[test]
    fn removing_two_dcs_restores_topology_exactly() {
        let old = cluster(
            3,
            vec![
                dc("dc1", &["rack1"], None),
                dc("dc2", &["rack1"], Some(0)),
                dc("dc3", &["rack1"], Some(0)),
            ],
        );
        let new = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(v.outcome.blocked);
        assert_eq!(v.outcome.reason, Some(ActionKind::CorrectCRDConfig));
        assert_eq!(v.spec.topology, old.spec.topology);
    }

    #[test]
    fn removing_a_dc_needs_it_scaled_to_zero() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], Some(2))]);
        let new = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert_eq!(v.outcome.reason, Some(ActionKind::CorrectCRDConfig));
        assert_eq!(v.removed_dc, None);

        let old = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], Some(0))]);
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(v.outcome.blocked);
        assert_eq!(v.outcome.reason, Some(ActionKind::DeleteDC));
        assert_eq!(v.removed_dc.as_deref(), Some("dc2"));
        assert_eq!(v.spec.topology, new.spec.topology);
    }

    #[test]
    fn removing_a_dc_waits_for_scale_down() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], Some(0))]);
        let new = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let mut status = status_for(&old);
        status.last_cluster_action = Some(ActionKind::ScaleDown);
        status.last_cluster_action_status = Some(ActionStatus::Ongoing);
        let v = check_non_allowed_changes(&new, &old, &status, None);
        assert_eq!(v.outcome.reason, Some(ActionKind::CorrectCRDConfig));
    }

    #[test]
    fn scale_to_zero_depends_on_probe() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], None)]);
        let new = cluster(3, vec![dc("dc1", &["rack1"], None), dc("dc2", &["rack1"], Some(0))]);
        let status = status_for(&old);

        for (probe, blocked) in [
            (DcDataCheck::NoPods, false),
            (DcDataCheck::NoData, false),
            (DcDataCheck::HasData(vec!["ks".into()]), true),
            (DcDataCheck::Unverifiable("no pod is running".into()), true),
        ] {
            let v = check_non_allowed_changes(&new, &old, &status, Some(&probe));
            assert_eq!(v.outcome.blocked, blocked, "{probe:?}");
            if blocked {
                assert_eq!(v.spec.topology, old.spec.topology);
            }
        }
    }

    #[test]
    fn resources_change_is_allowed() {
        let old = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        let mut new = old.clone();
        new.spec.resources = ResourceRequirements {
            requests: Some(ResourceSpec {
                cpu: Some("2".into()),
                memory: None,
            }),
            limits: None,
        };
        let v = check_non_allowed_changes(&new, &old, &status_for(&old), None);
        assert!(!v.outcome.blocked);
        assert!(v.update_resources);
    }

    #[test]
    fn last_applied_is_skipped_when_unchanged() {
        let mut cc = cluster(3, vec![dc("dc1", &["rack1"], None)]);
        assert!(last_applied(&cc).is_none());

        let payload = cc.last_applied_configuration().unwrap();
        cc.annotations_mut()
            .insert(crate::crd::ANNOTATION_LAST_APPLIED.into(), payload);
        assert!(last_applied(&cc).is_none());

        cc.spec.nodes_per_racks = 4;
        let old = last_applied(&cc).unwrap();
        assert_eq!(old.spec.nodes_per_racks, 3);

        cc.annotations_mut()
            .insert(crate::crd::ANNOTATION_LAST_APPLIED.into(), "{not json".into());
        assert!(last_applied(&cc).is_none());
    }
}
