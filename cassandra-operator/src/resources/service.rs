//! Services of a cluster: per rack, per DC and the JMX exporter.

use super::{
    dc_labels, dc_rack_labels, dc_service_name, exporter_service_name,
    owner_reference, statefulset_name,
};
use crate::crd::CassandraCluster;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

const CQL_PORT: i32 = 9042;
const EXPORTER_JMX_PORT: i32 = 1234;

fn headless(
    cc: &CassandraCluster,
    name: String,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    port_name: &str,
    port: i32,
    publish_not_ready: bool,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: cc.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(cc)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            cluster_ip: Some("None".into()),
            ports: Some(vec![ServicePort {
                name: Some(port_name.into()),
                port,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            selector: Some(selector),
            publish_not_ready_addresses: Some(publish_not_ready),
            ..Default::default()
        }),
        status: None,
    }
}

/// Headless Service `<cluster>-<dc>-<rack>` the rack's pod DNS names live under.
pub fn build_dc_rack_service(cc: &CassandraCluster, dc: &str, rack: &str) -> Service {
    let labels = dc_rack_labels(cc, dc, rack);
    let name = statefulset_name(cc, &crate::crd::dc_rack_name(dc, rack));
    headless(cc, name, labels.clone(), labels, "cql", CQL_PORT, true)
}

/// Headless Service `<cluster>-<dc>` over every pod of the DC.
pub fn build_dc_service(cc: &CassandraCluster, dc: &str) -> Service {
    let labels = dc_labels(cc, dc);
    headless(cc, dc_service_name(cc, dc), labels.clone(), labels, "cql", CQL_PORT, true)
}

/// Service `<cluster>-<dc>-exporter-jmx` scraped for JMX metrics.
pub fn build_exporter_service(cc: &CassandraCluster, dc: &str) -> Service {
    let selector = dc_labels(cc, dc);
    let mut labels = selector.clone();
    labels.insert("k8s-app".into(), "exporter-cassandra-jmx".into());
    headless(
        cc,
        exporter_service_name(cc, dc),
        labels,
        selector,
        "http-promcassjmx",
        EXPORTER_JMX_PORT,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CassandraClusterSpec;
    use crate::resources::LABEL_DC;

    #[test]
    fn service_names_and_selectors() {
        let mut cc = CassandraCluster::new("c", CassandraClusterSpec::default());
        cc.metadata.namespace = Some("ns".into());

        let rack = build_dc_rack_service(&cc, "dc1", "rack1");
        assert_eq!(rack.name_any(), "c-dc1-rack1");
        let spec = rack.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));

        let dc = build_dc_service(&cc, "dc1");
        assert_eq!(dc.name_any(), "c-dc1");
        assert_eq!(dc.spec.as_ref().unwrap().selector.as_ref().unwrap()[LABEL_DC], "dc1");

        let exporter = build_exporter_service(&cc, "dc1");
        assert_eq!(exporter.name_any(), "c-dc1-exporter-jmx");
        assert_eq!(exporter.labels()["k8s-app"], "exporter-cassandra-jmx");
    }
}
