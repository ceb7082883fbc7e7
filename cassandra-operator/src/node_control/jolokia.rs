//! Jolokia JSON-over-HTTP client for Cassandra's JMX MBeans.

use super::NodeControl;
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

const STORAGE_SERVICE: &str = "org.apache.cassandra.db:type=StorageService";
const COMPACTION_MANAGER: &str = "org.apache.cassandra.db:type=CompactionManager";
const STREAM_MANAGER: &str = "org.apache.cassandra.net:type=StreamManager";

/// Jolokia reply envelope.
#[derive(Debug, Deserialize)]
struct JolokiaResponse {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<String>,
}

/// Client of one node's Jolokia agent.
///
/// # Example
///
/// ```no_run
/// use cassandra_operator::node_control::{JolokiaClient, NodeControl};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let node = JolokiaClient::new("c-dc1-rack1-0.c-dc1-rack1", 8778)?
///     .with_basic_auth("monitor", "secret");
/// let mode = node.operation_mode().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JolokiaClient {
    host: String,
    url: String,
    http: HttpClient,
    auth: Option<(String, String)>,
}

impl JolokiaClient {
    /// Client for `http://<host>:<port>/jolokia/`.
    pub fn new(host: impl Into<String>, port: u16) -> OperatorResult<Self> {
        let host = host.into();
        Self::with_url(host.clone(), format!("http://{host}:{port}/jolokia/"))
    }

    /// Client for an explicit endpoint URL.
    pub fn with_url(host: impl Into<String>, url: impl Into<String>) -> OperatorResult<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(OperatorError::InvalidConfig(format!(
                "Jolokia URL must start with http:// or https://, got: {url}"
            )));
        }
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            host: host.into(),
            url,
            http,
            auth: None,
        })
    }

    /// Use HTTP basic authentication.
    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Node host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    async fn send(&self, body: Value) -> OperatorResult<Value> {
        let response = self
            .with_auth(self.http.post(&self.url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OperatorError::NodeControl(format!(
                "{}: HTTP {}: {}",
                self.host,
                status.as_u16(),
                message
            )));
        }

        let reply: JolokiaResponse = response.json().await?;
        if let Some(error) = reply.error.filter(|e| !e.is_empty()) {
            return Err(OperatorError::NodeControl(format!("{}: {}", self.host, error)));
        }
        if reply.status != 0 && reply.status != 200 {
            return Err(OperatorError::NodeControl(format!(
                "{}: Jolokia status {}",
                self.host, reply.status
            )));
        }
        Ok(reply.value)
    }

    async fn read(&self, mbean: &str, attribute: &str) -> OperatorResult<Value> {
        self.send(json!({
            "type": "read",
            "mbean": mbean,
            "attribute": attribute,
        }))
        .await
    }

    async fn exec(&self, mbean: &str, operation: &str, arguments: Value) -> OperatorResult<Value> {
        self.send(json!({
            "type": "exec",
            "mbean": mbean,
            "operation": operation,
            "arguments": arguments,
        }))
        .await
    }

    async fn read_strings(&self, attribute: &str) -> OperatorResult<Vec<String>> {
        let value = self.read(STORAGE_SERVICE, attribute).await?;
        string_list(&value).ok_or_else(|| {
            OperatorError::NodeControl(format!("{attribute} is not a list: {value}"))
        })
    }

    async fn keyspace_has_data_in_dc(&self, keyspace: &str, dc: &str) -> OperatorResult<bool> {
        let ranges = self
            .exec(STORAGE_SERVICE, "describeRingJMX", json!([keyspace]))
            .await
            .map_err(|e| {
                OperatorError::NodeControl(format!("cannot describe ring of {keyspace}: {e}"))
            })?;
        let needle = format!("datacenter:{dc}");
        Ok(ranges
            .as_array()
            .is_some_and(|r| r.iter().filter_map(Value::as_str).any(|r| r.contains(&needle))))
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

#[async_trait]
impl NodeControl for JolokiaClient {
    async fn operation_mode(&self) -> OperatorResult<String> {
        let value = self.read(STORAGE_SERVICE, "OperationMode").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn decommission(&self) -> OperatorResult<()> {
        tracing::info!(host = %self.host, "Decommissioning node");
        self.exec(STORAGE_SERVICE, "decommission", json!([])).await?;
        Ok(())
    }

    async fn cleanup(&self, keyspaces: &[String]) -> OperatorResult<()> {
        for keyspace in keyspaces {
            tracing::info!(host = %self.host, keyspace = %keyspace, "Cleanup of keyspace");
            self.exec(
                STORAGE_SERVICE,
                "forceKeyspaceCleanup(java.lang.String,[Ljava.lang.String;)",
                json!([keyspace, []]),
            )
            .await?;
        }
        Ok(())
    }

    async fn upgrade_sstables(&self, keyspaces: &[String], threads: i32) -> OperatorResult<()> {
        for keyspace in keyspaces {
            tracing::info!(host = %self.host, keyspace = %keyspace, "Upgrade SSTables of keyspace");
            self.exec(
                STORAGE_SERVICE,
                "upgradeSSTables(java.lang.String,boolean,int,[Ljava.lang.String;)",
                json!([keyspace, true, threads, []]),
            )
            .await?;
        }
        Ok(())
    }

    async fn rebuild(&self, source_dc: &str) -> OperatorResult<()> {
        self.exec(STORAGE_SERVICE, "rebuild(java.lang.String)", json!([source_dc]))
            .await?;
        Ok(())
    }

    async fn remove_node(&self, host_id: &str) -> OperatorResult<()> {
        self.exec(STORAGE_SERVICE, "removeNode", json!([host_id]))
            .await?;
        Ok(())
    }

    async fn keyspaces(&self) -> OperatorResult<Vec<String>> {
        self.read_strings("Keyspaces").await
    }

    async fn host_id_map(&self) -> OperatorResult<HashMap<String, String>> {
        let value = self.read(STORAGE_SERVICE, "HostIdMap").await?;
        let map = value.as_object().ok_or_else(|| {
            OperatorError::NodeControl(format!("HostIdMap is not a map: {value}"))
        })?;
        Ok(map
            .iter()
            .filter_map(|(ip, id)| id.as_str().map(|id| (ip.clone(), id.to_string())))
            .collect())
    }

    async fn leaving_nodes(&self) -> OperatorResult<Vec<String>> {
        self.read_strings("LeavingNodes").await
    }

    async fn joining_nodes(&self) -> OperatorResult<Vec<String>> {
        self.read_strings("JoiningNodes").await
    }

    async fn has_data_in_dc(&self, dc: &str) -> OperatorResult<Vec<String>> {
        let mut with_data = Vec::new();
        for keyspace in self.non_local_keyspaces().await? {
            if self.keyspace_has_data_in_dc(&keyspace, dc).await? {
                with_data.push(keyspace);
            }
        }
        Ok(with_data)
    }

    async fn has_compactions_of_type(&self, task_type: &str) -> OperatorResult<bool> {
        let value = self.read(COMPACTION_MANAGER, "Compactions").await?;
        Ok(value.as_array().is_some_and(|compactions| {
            compactions
                .iter()
                .any(|c| c.get("taskType").and_then(Value::as_str) == Some(task_type))
        }))
    }

    async fn has_streaming_sessions(&self) -> OperatorResult<bool> {
        let value = self.read(STREAM_MANAGER, "CurrentStreams").await?;
        Ok(value.as_array().is_some_and(|streams| !streams.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url() {
        let client = JolokiaClient::new("c-dc1-rack1-0.c-dc1-rack1", 8778).unwrap();
        assert_eq!(client.url, "http://c-dc1-rack1-0.c-dc1-rack1:8778/jolokia/");
        assert_eq!(client.host(), "c-dc1-rack1-0.c-dc1-rack1");
    }

    #[test]
    fn rejects_bad_scheme() {
        assert!(JolokiaClient::with_url("h", "ftp://h/jolokia/").is_err());
    }

    #[test]
    fn string_list_skips_non_strings() {
        let value = json!(["a", 1, "b"]);
        assert_eq!(string_list(&value), Some(vec!["a".into(), "b".into()]));
        assert_eq!(string_list(&json!("x")), None);
    }
}
