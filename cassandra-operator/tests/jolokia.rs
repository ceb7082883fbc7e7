//! Jolokia client against a mock agent.
//!
//! These tests use wiremock to play the Jolokia agent of a Cassandra node and
//! check both the requests sent and the handling of its replies.

use cassandra_operator::node_control::{COMPACTION_CLEANUP, JolokiaClient, NodeControl};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STORAGE_SERVICE: &str = "org.apache.cassandra.db:type=StorageService";

fn client(server: &MockServer) -> JolokiaClient {
    JolokiaClient::with_url("node-0", format!("{}/jolokia/", server.uri()))
        .expect("Failed to create client")
}

async fn mount_read(server: &MockServer, mbean: &str, attribute: &str, value: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/jolokia/"))
        .and(body_partial_json(json!({
            "type": "read",
            "mbean": mbean,
            "attribute": attribute,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": value,
            "status": 200,
        })))
        .mount(server)
        .await;
}

/// Test reading the operation mode attribute.
#[tokio::test]
async fn test_operation_mode() {
    let server = MockServer::start().await;
    mount_read(&server, STORAGE_SERVICE, "OperationMode", json!("NORMAL")).await;

    let node = client(&server);
    assert_eq!(node.operation_mode().await.unwrap(), "NORMAL");
}

/// Test listing joining nodes.
#[tokio::test]
async fn test_joining_nodes() {
    let server = MockServer::start().await;
    mount_read(&server, STORAGE_SERVICE, "JoiningNodes", json!(["10.0.0.4"])).await;

    let node = client(&server);
    assert_eq!(node.joining_nodes().await.unwrap(), ["10.0.0.4"]);
}

/// Test that a non-2xx reply names the host and the HTTP code.
#[tokio::test]
async fn test_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jolokia/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let node = client(&server);
    let err = node.operation_mode().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("node-0"), "{message}");
    assert!(message.contains("500"), "{message}");
}

/// Test that an error in the Jolokia envelope fails the call.
#[tokio::test]
async fn test_jolokia_error_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jolokia/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 404,
            "error": "javax.management.InstanceNotFoundException",
        })))
        .mount(&server)
        .await;

    let node = client(&server);
    let err = node.keyspaces().await.unwrap_err();
    assert!(err.to_string().contains("InstanceNotFoundException"));
}

/// Test the decommission exec request.
#[tokio::test]
async fn test_decommission_exec() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jolokia/"))
        .and(body_partial_json(json!({
            "type": "exec",
            "mbean": STORAGE_SERVICE,
            "operation": "decommission",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null, "status": 200})))
        .expect(1)
        .mount(&server)
        .await;

    let node = client(&server);
    node.decommission().await.unwrap();
}

/// Test that only keyspaces whose ring reaches the DC are reported.
#[tokio::test]
async fn test_has_data_in_dc() {
    let server = MockServer::start().await;
    mount_read(
        &server,
        STORAGE_SERVICE,
        "Keyspaces",
        json!(["system", "system_schema", "ks1", "ks2"]),
    )
    .await;
    for (keyspace, ranges) in [
        ("ks1", json!(["TokenRange(endpoint_details:[EndpointDetails(host:10.0.0.1, datacenter:dc1, rack:rack1)])"])),
        ("ks2", json!(["TokenRange(endpoint_details:[EndpointDetails(host:10.0.1.1, datacenter:dc2, rack:rack1)])"])),
    ] {
        Mock::given(method("POST"))
            .and(path("/jolokia/"))
            .and(body_partial_json(json!({
                "type": "exec",
                "operation": "describeRingJMX",
                "arguments": [keyspace],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": ranges,
                "status": 200,
            })))
            .mount(&server)
            .await;
    }

    let node = client(&server);
    assert_eq!(node.has_data_in_dc("dc2").await.unwrap(), ["ks2"]);
    assert!(node.has_data_in_dc("dc3").await.unwrap().is_empty());
}

/// Test matching running compactions by task type.
#[tokio::test]
async fn test_compactions_of_type() {
    let server = MockServer::start().await;
    mount_read(
        &server,
        "org.apache.cassandra.db:type=CompactionManager",
        "Compactions",
        json!([{"taskType": "Cleanup", "keyspace": "ks1"}]),
    )
    .await;

    let node = client(&server);
    assert!(node.has_compactions_of_type(COMPACTION_CLEANUP).await.unwrap());
    assert!(!node.has_compactions_of_type("Upgrade sstables").await.unwrap());
}
