//! PodDisruptionBudget of a cluster.

use super::{cluster_labels, owner_reference};
use crate::crd::CassandraCluster;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

/// Budget named after the cluster, selecting all its pods.
pub fn build_pod_disruption_budget(cc: &CassandraCluster) -> PodDisruptionBudget {
    let labels = cluster_labels(cc);
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(cc.name_any()),
            namespace: cc.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cc)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(cc.spec.max_pod_unavailable)),
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CassandraClusterSpec;

    #[test]
    fn budget_uses_max_pod_unavailable() {
        let cc = CassandraCluster::new(
            "c",
            CassandraClusterSpec {
                max_pod_unavailable: 2,
                ..Default::default()
            },
        );
        let pdb = build_pod_disruption_budget(&cc);
        assert_eq!(pdb.name_any(), "c");
        assert_eq!(
            pdb.spec.unwrap().max_unavailable,
            Some(IntOrString::Int(2))
        );
    }
}
