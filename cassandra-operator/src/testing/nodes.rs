//! Scriptable Cassandra nodes.

use crate::crd::CassandraCluster;
use crate::error::{OperatorError, OperatorResult};
use crate::node_control::{NodeControl, NodeControlFactory, OPERATION_MODE_NORMAL};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A state-changing call received by a [`FakeNodeControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    /// `decommission`
    Decommission,
    /// `cleanup` on these keyspaces.
    Cleanup(Vec<String>),
    /// `upgrade_sstables` on these keyspaces with this many threads.
    UpgradeSSTables(Vec<String>, i32),
    /// `rebuild` from this DC.
    Rebuild(String),
    /// `remove_node` of this host id.
    RemoveNode(String),
}

#[derive(Debug)]
struct NodeState {
    operation_mode: String,
    keyspaces: Vec<String>,
    host_ids: HashMap<String, String>,
    leaving: Vec<String>,
    joining: Vec<String>,
    data_in_dc: Vec<String>,
    compactions: HashSet<String>,
    streaming: bool,
    failing: HashSet<&'static str>,
    latency: Option<Duration>,
    calls: Vec<NodeCall>,
}

/// In-memory [`NodeControl`] answering from configured state.
///
/// The default node is `NORMAL`, owns `system`, `system_schema` and `ks1`,
/// has nothing joining, leaving, compacting or streaming, and holds no data
/// for any DC.
///
/// ```
/// use cassandra_operator::testing::FakeNodeControl;
///
/// let node = FakeNodeControl::new()
///     .with_operation_mode("LEAVING")
///     .with_failure("keyspaces");
/// # let _ = node;
/// ```
#[derive(Debug)]
pub struct FakeNodeControl {
    state: Mutex<NodeState>,
}

impl Default for FakeNodeControl {
    fn default() -> Self {
        Self {
            state: Mutex::new(NodeState {
                operation_mode: OPERATION_MODE_NORMAL.to_string(),
                keyspaces: vec!["system".into(), "system_schema".into(), "ks1".into()],
                host_ids: HashMap::new(),
                leaving: Vec::new(),
                joining: Vec::new(),
                data_in_dc: Vec::new(),
                compactions: HashSet::new(),
                streaming: false,
                failing: HashSet::new(),
                latency: None,
                calls: Vec::new(),
            }),
        }
    }
}

impl FakeNodeControl {
    /// A healthy `NORMAL` node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start in another operation mode.
    pub fn with_operation_mode(self, mode: &str) -> Self {
        self.set_operation_mode(mode);
        self
    }

    /// Replace the keyspace list.
    pub fn with_keyspaces(self, keyspaces: &[&str]) -> Self {
        self.state.lock().keyspaces = keyspaces.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Map node addresses to host ids.
    pub fn with_host_ids(self, ids: &[(&str, &str)]) -> Self {
        self.state.lock().host_ids = ids
            .iter()
            .map(|(addr, id)| (addr.to_string(), id.to_string()))
            .collect();
        self
    }

    /// Keyspaces reported as replicated to any DC.
    pub fn with_data_in_dc(self, keyspaces: &[&str]) -> Self {
        self.state.lock().data_in_dc = keyspaces.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Make a method fail until healed.
    pub fn with_failure(self, method: &'static str) -> Self {
        self.fail(method);
        self
    }

    /// Delay every state-changing call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Change the operation mode.
    pub fn set_operation_mode(&self, mode: &str) {
        self.state.lock().operation_mode = mode.to_string();
    }

    /// Change the joining nodes.
    pub fn set_joining(&self, nodes: &[&str]) {
        self.state.lock().joining = nodes.iter().map(|n| n.to_string()).collect();
    }

    /// Change the leaving nodes.
    pub fn set_leaving(&self, nodes: &[&str]) {
        self.state.lock().leaving = nodes.iter().map(|n| n.to_string()).collect();
    }

    /// Start or stop a compaction of `task_type`.
    pub fn set_compaction(&self, task_type: &str, running: bool) {
        let mut state = self.state.lock();
        if running {
            state.compactions.insert(task_type.to_string());
        } else {
            state.compactions.remove(task_type);
        }
    }

    /// Start or stop streaming.
    pub fn set_streaming(&self, streaming: bool) {
        self.state.lock().streaming = streaming;
    }

    /// Make `method` return an error.
    pub fn fail(&self, method: &'static str) {
        self.state.lock().failing.insert(method);
    }

    /// Make `method` succeed again.
    pub fn heal(&self, method: &'static str) {
        self.state.lock().failing.remove(method);
    }

    /// State-changing calls received so far.
    pub fn calls(&self) -> Vec<NodeCall> {
        self.state.lock().calls.clone()
    }

    fn check(&self, method: &'static str) -> OperatorResult<()> {
        if self.state.lock().failing.contains(method) {
            return Err(OperatorError::NodeControl(format!("{method} failed")));
        }
        Ok(())
    }

    async fn record(&self, method: &'static str, call: NodeCall) -> OperatorResult<()> {
        self.check(method)?;
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeControl for FakeNodeControl {
    async fn operation_mode(&self) -> OperatorResult<String> {
        self.check("operation_mode")?;
        Ok(self.state.lock().operation_mode.clone())
    }

    async fn decommission(&self) -> OperatorResult<()> {
        self.record("decommission", NodeCall::Decommission).await
    }

    async fn cleanup(&self, keyspaces: &[String]) -> OperatorResult<()> {
        self.record("cleanup", NodeCall::Cleanup(keyspaces.to_vec())).await
    }

    async fn upgrade_sstables(&self, keyspaces: &[String], threads: i32) -> OperatorResult<()> {
        self.record(
            "upgrade_sstables",
            NodeCall::UpgradeSSTables(keyspaces.to_vec(), threads),
        )
        .await
    }

    async fn rebuild(&self, source_dc: &str) -> OperatorResult<()> {
        self.record("rebuild", NodeCall::Rebuild(source_dc.to_string())).await
    }

    async fn remove_node(&self, host_id: &str) -> OperatorResult<()> {
        self.record("remove_node", NodeCall::RemoveNode(host_id.to_string())).await
    }

    async fn keyspaces(&self) -> OperatorResult<Vec<String>> {
        self.check("keyspaces")?;
        Ok(self.state.lock().keyspaces.clone())
    }

    async fn host_id_map(&self) -> OperatorResult<HashMap<String, String>> {
        self.check("host_id_map")?;
        Ok(self.state.lock().host_ids.clone())
    }

    async fn leaving_nodes(&self) -> OperatorResult<Vec<String>> {
        self.check("leaving_nodes")?;
        Ok(self.state.lock().leaving.clone())
    }

    async fn joining_nodes(&self) -> OperatorResult<Vec<String>> {
        self.check("joining_nodes")?;
        Ok(self.state.lock().joining.clone())
    }

    async fn has_data_in_dc(&self, _dc: &str) -> OperatorResult<Vec<String>> {
        self.check("has_data_in_dc")?;
        Ok(self.state.lock().data_in_dc.clone())
    }

    async fn has_compactions_of_type(&self, task_type: &str) -> OperatorResult<bool> {
        self.check("has_compactions_of_type")?;
        Ok(self.state.lock().compactions.contains(task_type))
    }

    async fn has_streaming_sessions(&self) -> OperatorResult<bool> {
        self.check("has_streaming_sessions")?;
        Ok(self.state.lock().streaming)
    }
}

/// [`NodeControlFactory`] handing out [`FakeNodeControl`]s.
///
/// Pods without a node of their own share the default node.
pub struct FakeNodeFactory {
    default: Arc<FakeNodeControl>,
    nodes: RwLock<HashMap<String, Arc<FakeNodeControl>>>,
    unreachable: RwLock<HashSet<String>>,
    connections: Mutex<Vec<String>>,
}

impl Default for FakeNodeFactory {
    fn default() -> Self {
        Self::new(Arc::new(FakeNodeControl::default()))
    }
}

impl FakeNodeFactory {
    /// Factory whose pods share `default`.
    pub fn new(default: Arc<FakeNodeControl>) -> Self {
        Self {
            default,
            nodes: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// The shared default node.
    pub fn node(&self) -> Arc<FakeNodeControl> {
        self.default.clone()
    }

    /// Node serving `pod_name`.
    pub fn node_for(&self, pod_name: &str) -> Arc<FakeNodeControl> {
        self.nodes
            .read()
            .get(pod_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Give `pod_name` its own node.
    pub fn set_node(&self, pod_name: &str, node: Arc<FakeNodeControl>) {
        self.nodes.write().insert(pod_name.to_string(), node);
    }

    /// Refuse or accept connections to `pod_name`.
    pub fn set_unreachable(&self, pod_name: &str, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(pod_name.to_string());
        } else {
            set.remove(pod_name);
        }
    }

    /// Pod names connected to, in order.
    pub fn connections(&self) -> Vec<String> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl NodeControlFactory for FakeNodeFactory {
    async fn connect(
        &self,
        _cluster: &CassandraCluster,
        pod: &Pod,
    ) -> OperatorResult<Arc<dyn NodeControl>> {
        let name = pod.name_any();
        if self.unreachable.read().contains(&name) {
            return Err(OperatorError::NodeControl(format!("{name}: connection refused")));
        }
        self.connections.lock().push(name.clone());
        Ok(self.node_for(&name))
    }
}
