//! StatefulSet of a rack.

use super::{
    CONTAINER_CASSANDRA, ENV_SEEDS, INIT_CONTAINER_BOOTSTRAP, dc_rack_labels, owner_reference,
    statefulset_name,
};
use crate::crd::{CassandraCluster, CassandraClusterSpec, CassandraClusterStatus, ResourceSpec};
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, ResourceRequirements, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;

const DATA_VOLUME: &str = "data";
const DATA_PATH: &str = "/var/lib/cassandra";
const CONFIG_VOLUME: &str = "cassandra-config";
const CONFIG_PATH: &str = "/configmap";

/// `<baseImage>:<version>`.
pub fn cassandra_image(spec: &CassandraClusterSpec) -> String {
    format!("{}:{}", spec.base_image, spec.version)
}

fn quantities(spec: Option<&ResourceSpec>) -> Option<BTreeMap<String, Quantity>> {
    let spec = spec?;
    let mut map = BTreeMap::new();
    if let Some(cpu) = &spec.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// Desired StatefulSet of `dc`/`rack`.
///
/// The seed list comes from `status` so a pending seed list change only
/// reaches the pods once it is flipped to ToDo on every rack.
pub fn build_statefulset(
    cc: &CassandraCluster,
    status: &CassandraClusterStatus,
    dc: &str,
    rack: &str,
) -> StatefulSet {
    let dc_rack = crate::crd::dc_rack_name(dc, rack);
    let name = statefulset_name(cc, &dc_rack);
    let labels = dc_rack_labels(cc, dc, rack);
    let image = cassandra_image(&cc.spec);

    let node_env = vec![
        env("CASSANDRA_CLUSTER_NAME", cc.name_any()),
        env("CASSANDRA_DC", dc),
        env("CASSANDRA_RACK", rack),
        env("CASSANDRA_NUM_TOKENS", cc.num_tokens(&dc_rack).to_string()),
    ];

    let mut bootstrap_env = vec![env(ENV_SEEDS, status.seedlist.join(","))];
    bootstrap_env.extend(node_env.iter().cloned());

    let mut volumes = Vec::new();
    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME.into(),
        mount_path: DATA_PATH.into(),
        ..Default::default()
    }];
    if let Some(config_map) = cc.config_map_name() {
        volumes.push(Volume {
            name: CONFIG_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.into(),
            mount_path: CONFIG_PATH.into(),
            ..Default::default()
        });
    }

    let bootstrap = Container {
        name: INIT_CONTAINER_BOOTSTRAP.into(),
        image: Some(image.clone()),
        image_pull_policy: Some(cc.spec.image_pull_policy.clone()),
        command: Some(vec![
            "sh".into(),
            "-c".into(),
            "cp -vr /etc/cassandra/* /bootstrap".into(),
        ]),
        env: Some(bootstrap_env),
        ..Default::default()
    };

    let cassandra = Container {
        name: CONTAINER_CASSANDRA.into(),
        image: Some(image),
        image_pull_policy: Some(cc.spec.image_pull_policy.clone()),
        env: Some(node_env),
        ports: Some(vec![
            port("intra-node", 7000),
            port("intra-node-tls", 7001),
            port("jmx-port", 7199),
            port("cql", 9042),
            port("jolokia", 8778),
        ]),
        resources: Some(ResourceRequirements {
            requests: quantities(cc.spec.resources.requests.as_ref()),
            limits: quantities(cc.spec.resources.limits.as_ref()),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let node_selector = cc.node_selector(&dc_rack);

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.into()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: cc.data_storage_class_for_dc(dc),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [(
                        "storage".to_string(),
                        Quantity(cc.data_capacity_for_dc(dc)),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cc.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cc)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(name),
            replicas: Some(cc.nodes_per_racks(&dc_rack)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            pod_management_policy: Some("OrderedReady".into()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(cc.rolling_partition(&dc_rack)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![bootstrap]),
                    containers: vec![cassandra],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    node_selector: (!node_selector.is_empty()).then_some(node_selector),
                    termination_grace_period_seconds: Some(1800),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        status: None,
    }
}

fn bootstrap_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .init_containers
        .as_ref()?
        .iter()
        .find(|c| c.name == INIT_CONTAINER_BOOTSTRAP)
}

/// Raw `CASSANDRA_SEEDS` value of the bootstrap init container.
pub(crate) fn stored_seed_env(sts: &StatefulSet) -> Option<String> {
    bootstrap_container(sts)?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == ENV_SEEDS)
        .and_then(|e| e.value.clone())
}

/// Seed list the StatefulSet's pods boot with.
pub fn stored_seed_list(sts: &StatefulSet) -> Vec<String> {
    stored_seed_env(sts)
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Overwrite `CASSANDRA_SEEDS` in the bootstrap init container.
pub(crate) fn set_seed_env(sts: &mut StatefulSet, value: &str) {
    let Some(init) = sts
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.init_containers.as_mut())
    else {
        return;
    };
    for container in init.iter_mut().filter(|c| c.name == INIT_CONTAINER_BOOTSTRAP) {
        for var in container.env.iter_mut().flatten() {
            if var.name == ENV_SEEDS {
                var.value = Some(value.to_string());
            }
        }
    }
}

/// The part of a StatefulSet the operator owns.
#[derive(Debug, PartialEq)]
struct Projection<'a> {
    replicas: Option<i32>,
    template_labels: Option<&'a BTreeMap<String, String>>,
    containers: Vec<(&'a str, Option<&'a str>, Option<&'a Vec<EnvVar>>, Option<&'a ResourceRequirements>)>,
    init_env: Vec<Option<&'a Vec<EnvVar>>>,
    config_maps: Vec<&'a str>,
    node_selector: Option<&'a BTreeMap<String, String>>,
    partition: Option<i32>,
    claims: Vec<(Option<&'a str>, Option<&'a Quantity>, Option<&'a str>)>,
}

fn project(sts: &StatefulSet) -> Option<Projection<'_>> {
    let spec = sts.spec.as_ref()?;
    let pod = spec.template.spec.as_ref()?;

    let mut containers: Vec<_> = pod
        .containers
        .iter()
        .map(|c| {
            (
                c.name.as_str(),
                c.image.as_deref(),
                c.env.as_ref(),
                c.resources.as_ref(),
            )
        })
        .collect();
    containers.sort_by(|a, b| a.0.cmp(b.0));

    let mut claims: Vec<_> = spec
        .volume_claim_templates
        .iter()
        .flatten()
        .map(|c| {
            let claim_spec = c.spec.as_ref();
            (
                c.metadata.name.as_deref(),
                claim_spec
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("storage")),
                claim_spec.and_then(|s| s.storage_class_name.as_deref()),
            )
        })
        .collect();
    claims.sort_by(|a, b| a.0.cmp(&b.0));

    Some(Projection {
        replicas: spec.replicas,
        template_labels: spec.template.metadata.as_ref().and_then(|m| m.labels.as_ref()),
        containers,
        init_env: pod
            .init_containers
            .iter()
            .flatten()
            .map(|c| c.env.as_ref())
            .collect(),
        config_maps: pod
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.config_map.as_ref().map(|c| c.name.as_str()))
            .collect(),
        node_selector: pod.node_selector.as_ref(),
        partition: spec
            .update_strategy
            .as_ref()
            .and_then(|u| u.rolling_update.as_ref())
            .and_then(|r| r.partition),
        claims,
    })
}

/// Whether two StatefulSets agree on every field the operator manages.
pub fn statefulsets_are_equal(a: &StatefulSet, b: &StatefulSet) -> bool {
    project(a) == project(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CassandraClusterSpec, Dc, Rack, Topology};

    fn cluster() -> CassandraCluster {
        let mut cc = CassandraCluster::new(
            "c",
            CassandraClusterSpec {
                nodes_per_racks: 3,
                base_image: "cassandra".into(),
                version: "3.11".into(),
                data_capacity: "3Gi".into(),
                config_map_name: Some("c-config".into()),
                topology: Topology {
                    dc: vec![Dc {
                        name: "dc1".into(),
                        rack: vec![Rack {
                            name: "rack1".into(),
                            rolling_partition: 1,
                            ..Default::default()
                        }],
                        num_tokens: Some(16),
                        ..Default::default()
                    }],
                },
                ..Default::default()
            },
        );
        cc.metadata.namespace = Some("ns".into());
        cc
    }

    fn status() -> CassandraClusterStatus {
        CassandraClusterStatus {
            seedlist: vec!["a".into(), "b".into()],
            ..Default::default()
        }
    }

    #[test]
    fn builds_rack_statefulset() {
        let cc = cluster();
        let sts = build_statefulset(&cc, &status(), "dc1", "rack1");
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(sts.name_any(), "c-dc1-rack1");
        assert_eq!(spec.service_name.as_deref(), Some("c-dc1-rack1"));
        assert_eq!(spec.replicas, Some(3));

        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("cassandra:3.11"));
        assert_eq!(
            pod.volumes.as_ref().unwrap()[0].config_map.as_ref().unwrap().name,
            "c-config"
        );
        assert_eq!(stored_seed_list(&sts), vec!["a", "b"]);
        assert_eq!(
            spec.update_strategy.as_ref().unwrap().rolling_update.as_ref().unwrap().partition,
            Some(1)
        );
        let env = pod.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "CASSANDRA_NUM_TOKENS" && e.value.as_deref() == Some("16")));
    }

    #[test]
    fn equality_tracks_managed_fields() {
        let cc = cluster();
        let a = build_statefulset(&cc, &status(), "dc1", "rack1");
        let mut b = a.clone();
        b.metadata.resource_version = Some("42".into());
        assert!(statefulsets_are_equal(&a, &b));

        set_seed_env(&mut b, "a,b,c");
        assert!(!statefulsets_are_equal(&a, &b));
        assert_eq!(stored_seed_list(&b), vec!["a", "b", "c"]);

        let mut c = a.clone();
        c.spec.as_mut().unwrap().replicas = Some(4);
        assert!(!statefulsets_are_equal(&a, &c));
    }
}
