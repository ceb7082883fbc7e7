//! Dispatch of labelled pod operations.
//!
//! A pod labelled `operation-name=<op>` and `operation-status=ToDo` is picked
//! up by [`PodOperations::execute`]: it is relabelled `Ongoing`, recorded in
//! the rack's `podLastOperation`, and handed to a background task running the
//! [`PodOperationKind`] against its node. The reconcile pass does not wait.
//!
//! Every finished task reports to a single collector over a bounded channel.
//! The collector labels the pod `Done` or `Error` and moves it from `pods` to
//! `podsOK`/`podsKO` on a freshly fetched cluster, retrying until the write
//! goes through or the objects are gone.

use super::children::update_pod_labels;
use super::{ControllerContext, PodOperationKind, Resync, write_status};
use crate::crd::{
    ActionKind, ActionStatus, CassandraCluster, CassandraClusterStatus, OperationName,
    PodLastOperation, dc_rack_name,
};
use crate::error::OperatorResult;
use crate::resources::{
    LABEL_OPERATION_END, LABEL_OPERATION_NAME, LABEL_OPERATION_START, LABEL_OPERATION_STATUS,
    dc_rack_labels, label_time, pod_is_running, sort_pods,
};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Outcome of one pod operation, sent to the collector.
#[derive(Debug)]
struct Finalized {
    namespace: String,
    cluster: String,
    dc_rack: String,
    pod: String,
    operation: OperationName,
    succeeded: bool,
}

/// Runs pod operations and decommissions in the background.
pub struct PodOperations<S> {
    pub(super) ctx: Arc<ControllerContext<S>>,
    tasks: Mutex<JoinSet<()>>,
    finalize: Mutex<Option<mpsc::Sender<Finalized>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ObjectStore> PodOperations<S> {
    /// Start the finalize collector. Must be called inside a tokio runtime.
    pub fn new(ctx: Arc<ControllerContext<S>>) -> Self {
        let (tx, rx) = mpsc::channel(ctx.config.finalize_queue_capacity);
        let collector = tokio::spawn(collect(ctx.clone(), rx));
        Self {
            ctx,
            tasks: Mutex::new(JoinSet::new()),
            finalize: Mutex::new(Some(tx)),
            collector: Mutex::new(Some(collector)),
        }
    }

    /// Number of background tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.reap();
        self.tasks.lock().len()
    }

    /// Abort running tasks, drain the collector and wait for it to stop.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.shutdown().await;
        drop(self.finalize.lock().take());
        let collector = self.collector.lock().take();
        if let Some(collector) = collector {
            if let Err(e) = collector.await {
                tracing::error!(error = %e, "Finalize collector ended abnormally");
            }
        }
        tracing::info!("Pod operations stopped");
    }

    pub(super) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.tasks.lock().spawn(task);
    }

    fn reap(&self) {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Pod operation task panicked");
                }
            }
        }
    }

    /// Run the pod operation step of a rack.
    ///
    /// A scale down drives the decommission of the last pod; otherwise, once
    /// the cluster action is Done, one operation kind picked at random is
    /// dispatched.
    pub async fn execute(
        &self,
        cc: &mut CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
    ) -> OperatorResult<Resync> {
        let dc_rack = dc_rack_name(dc, rack);
        let scaling_down = status.cassandra_rack_status.get(&dc_rack).is_some_and(|r| {
            r.cassandra_last_action.name == Some(ActionKind::ScaleDown)
                && r.cassandra_last_action.status_in(&[
                    ActionStatus::ToDo,
                    ActionStatus::Ongoing,
                    ActionStatus::Continue,
                ])
        });
        if scaling_down {
            return self.ensure_decommission(cc, status, dc, rack).await;
        }

        if status.last_cluster_action_status == Some(ActionStatus::Done) {
            let kind = self.ctx.random_operation();
            self.ensure_operation(cc, status, dc, rack, kind).await?;
        }
        Ok(Resync::Continue)
    }

    /// Start `kind` on the pods labelled for it, or resume monitoring pods
    /// another operator instance left Ongoing.
    pub async fn ensure_operation(
        &self,
        cc: &mut CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
        kind: PodOperationKind,
    ) -> OperatorResult<()> {
        let (pods, monitor_only) = self.pods_to_work_on(cc, status, dc, rack, kind).await?;
        if pods.is_empty() {
            return Ok(());
        }
        let dc_rack = dc_rack_name(dc, rack);
        let cluster = cc.name_any();
        let namespace = cc.namespace().unwrap_or_default();

        if monitor_only {
            for pod in pods {
                tracing::info!(cluster = %cluster, dc_rack = %dc_rack, pod = %pod.name_any(), operation = %kind.name(), "Monitoring adopted operation");
                let ctx = self.ctx.clone();
                let sender = self.sender();
                let cc = cc.clone();
                let dc_rack = dc_rack.clone();
                self.spawn(async move {
                    let succeeded = monitor(&ctx, kind, &cc, &pod).await;
                    report(sender, &cc, &dc_rack, &pod, kind.name(), succeeded).await;
                });
            }
            return Ok(());
        }

        let now = self.ctx.now();
        let labels: BTreeMap<String, String> = [
            (LABEL_OPERATION_STATUS.to_string(), ActionStatus::Ongoing.as_str().to_string()),
            (LABEL_OPERATION_START.to_string(), label_time(now)),
            (LABEL_OPERATION_END.to_string(), String::new()),
        ]
        .into();

        let mut started = Vec::new();
        for pod in pods {
            let name = pod.name_any();
            if let Err(e) = update_pod_labels(self.ctx.store.as_ref(), &namespace, &name, &labels).await {
                tracing::error!(cluster = %cluster, pod = %name, operation = %kind.name(), error = %e, "Cannot label pod, operation skipped");
                continue;
            }
            started.push(pod);
        }
        if started.is_empty() {
            return Ok(());
        }

        let op = &mut status
            .cassandra_rack_status
            .entry(dc_rack.clone())
            .or_default()
            .pod_last_operation;
        for pod in &started {
            let name = pod.name_any();
            if !op.pods.contains(&name) {
                op.pods.push(name.clone());
            }
            op.pods_ok.retain(|p| *p != name);
            op.pods_ko.retain(|p| *p != name);
        }
        op.operator_name = self.ctx.config.operator_name.clone();
        write_status(self.ctx.store.as_ref(), cc, status).await?;

        for pod in started {
            tracing::info!(cluster = %cluster, dc_rack = %dc_rack, pod = %pod.name_any(), operation = %kind.name(), "Operation dispatched");
            let ctx = self.ctx.clone();
            let sender = self.sender();
            let cc = cc.clone();
            let dc_rack = dc_rack.clone();
            self.spawn(async move {
                let succeeded = run(&ctx, kind, &cc, &pod).await;
                report(sender, &cc, &dc_rack, &pod, kind.name(), succeeded).await;
            });
        }
        Ok(())
    }

    /// Pods to start `kind` on, and whether they only need monitoring.
    async fn pods_to_work_on(
        &self,
        cc: &CassandraCluster,
        status: &mut CassandraClusterStatus,
        dc: &str,
        rack: &str,
        kind: PodOperationKind,
    ) -> OperatorResult<(Vec<Pod>, bool)> {
        let operator = &self.ctx.config.operator_name;
        if operator.is_empty() {
            tracing::debug!(cluster = %cc.name_any(), "No operator identity, pod operations disabled");
            return Ok((Vec::new(), false));
        }
        let namespace = cc.namespace().unwrap_or_default();
        let now = self.ctx.now();
        let name = kind.name();
        let dc_rack = dc_rack_name(dc, rack);
        let op = &mut status
            .cassandra_rack_status
            .entry(dc_rack.clone())
            .or_default()
            .pod_last_operation;

        if op.is(name, ActionStatus::Ongoing) && op.operator_name != *operator {
            tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, operation = %name, previous = %op.operator_name, "Adopting operation");
            op.operator_name = operator.clone();
            let mut pods = Vec::new();
            for pod_name in &op.pods {
                match self.ctx.store.get::<Pod>(&namespace, pod_name).await {
                    Ok(pod) if pod_is_running(&pod) => pods.push(pod),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            if pods.is_empty() {
                op.status = Some(ActionStatus::Done);
                op.end_time = Some(now);
            }
            return Ok((pods, true));
        }

        let mut selector = dc_rack_labels(cc, dc, rack);
        selector.insert(LABEL_OPERATION_NAME.into(), name.as_str().into());
        selector.insert(LABEL_OPERATION_STATUS.into(), ActionStatus::ToDo.as_str().into());
        let mut pods: Vec<Pod> = self.ctx.store.list(&namespace, &selector).await?;
        sort_pods(&mut pods);

        if pods.is_empty() {
            if op.is(name, ActionStatus::Ongoing) && op.pods.is_empty() {
                tracing::info!(cluster = %cc.name_any(), dc_rack = %dc_rack, operation = %name, "Operation done on every pod");
                op.status = Some(ActionStatus::Done);
                op.end_time = Some(now);
            }
            return Ok((Vec::new(), false));
        }

        if op.status == Some(ActionStatus::Ongoing) && op.name != Some(name) && !op.pods.is_empty() {
            tracing::info!(
                cluster = %cc.name_any(),
                dc_rack = %dc_rack,
                running = ?op.name,
                waiting = %name,
                "Another operation is running on the rack"
            );
            return Ok((Vec::new(), false));
        }
        if !op.is(name, ActionStatus::Ongoing) {
            *op = PodLastOperation {
                name: Some(name),
                status: Some(ActionStatus::Ongoing),
                start_time: Some(now),
                operator_name: op.operator_name.clone(),
                ..Default::default()
            };
        }
        Ok((pods.into_iter().filter(pod_is_running).collect(), false))
    }

    fn sender(&self) -> Option<mpsc::Sender<Finalized>> {
        self.finalize.lock().clone()
    }
}

/// Execute the operation, then its post-action when it succeeded.
async fn run<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    kind: PodOperationKind,
    cc: &CassandraCluster,
    pod: &Pod,
) -> bool {
    let result: OperatorResult<()> = async {
        let node = ctx.nodes.connect(cc, pod).await?;
        kind.execute(ctx.store.as_ref(), cc, pod, node.as_ref()).await?;
        kind.post_action(ctx.store.as_ref(), &ctx.config, cc, pod).await
    }
    .await;
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(cluster = %cc.name_any(), pod = %pod.name_any(), operation = %kind.name(), error = %e, "Operation failed");
            false
        }
    }
}

/// Poll the node until the operation is over, then run the post-action.
async fn monitor<S: ObjectStore>(
    ctx: &ControllerContext<S>,
    kind: PodOperationKind,
    cc: &CassandraCluster,
    pod: &Pod,
) -> bool {
    loop {
        let running = match ctx.nodes.connect(cc, pod).await {
            Ok(node) => kind.still_running(node.as_ref()).await,
            Err(e) => Err(e),
        };
        match running {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => tracing::debug!(pod = %pod.name_any(), operation = %kind.name(), error = %e, "Cannot check operation, assuming it still runs"),
        }
        tokio::time::sleep(ctx.config.monitor_interval()).await;
    }
    match kind.post_action(ctx.store.as_ref(), &ctx.config, cc, pod).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(cluster = %cc.name_any(), pod = %pod.name_any(), operation = %kind.name(), error = %e, "Post action failed");
            false
        }
    }
}

async fn report(
    sender: Option<mpsc::Sender<Finalized>>,
    cc: &CassandraCluster,
    dc_rack: &str,
    pod: &Pod,
    operation: OperationName,
    succeeded: bool,
) {
    let message = Finalized {
        namespace: cc.namespace().unwrap_or_default(),
        cluster: cc.name_any(),
        dc_rack: dc_rack.to_string(),
        pod: pod.name_any(),
        operation,
        succeeded,
    };
    let Some(sender) = sender else {
        tracing::warn!(pod = %message.pod, "Collector stopped, operation result dropped");
        return;
    };
    if sender.send(message).await.is_err() {
        tracing::warn!(pod = %pod.name_any(), "Collector stopped, operation result dropped");
    }
}

async fn collect<S: ObjectStore>(ctx: Arc<ControllerContext<S>>, mut rx: mpsc::Receiver<Finalized>) {
    while let Some(message) = rx.recv().await {
        finalize(&ctx, &message).await;
    }
    tracing::debug!("Finalize channel closed");
}

/// Record the end of an operation on the pod labels and the rack status.
async fn finalize<S: ObjectStore>(ctx: &ControllerContext<S>, message: &Finalized) {
    let outcome = if message.succeeded {
        ActionStatus::Done
    } else {
        ActionStatus::Error
    };

    loop {
        let labels: BTreeMap<String, String> = [
            (LABEL_OPERATION_STATUS.to_string(), outcome.as_str().to_string()),
            (LABEL_OPERATION_END.to_string(), label_time(ctx.now())),
        ]
        .into();
        match update_pod_labels(ctx.store.as_ref(), &message.namespace, &message.pod, &labels).await {
            Ok(()) => break,
            Err(e) if e.is_not_found() => {
                tracing::info!(pod = %message.pod, "Pod gone, labels not updated");
                break;
            }
            Err(e) => {
                tracing::warn!(pod = %message.pod, error = %e, "Cannot label pod, retrying");
                tokio::time::sleep(ctx.config.retry_interval()).await;
            }
        }
    }

    loop {
        let mut cc: CassandraCluster = match ctx.store.get(&message.namespace, &message.cluster).await {
            Ok(cc) => cc,
            Err(e) if e.is_not_found() => {
                tracing::info!(cluster = %message.cluster, "Cluster gone, operation result dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(cluster = %message.cluster, error = %e, "Cannot fetch cluster, retrying");
                tokio::time::sleep(ctx.config.retry_interval()).await;
                continue;
            }
        };
        let status = cc.status.get_or_insert_with(Default::default);
        let Some(rack) = status.cassandra_rack_status.get_mut(&message.dc_rack) else {
            tracing::info!(cluster = %message.cluster, dc_rack = %message.dc_rack, "Rack gone, operation result dropped");
            return;
        };
        let op = &mut rack.pod_last_operation;
        op.pods.retain(|p| *p != message.pod);
        let target = if message.succeeded { &mut op.pods_ok } else { &mut op.pods_ko };
        if !target.contains(&message.pod) {
            target.push(message.pod.clone());
        }

        match ctx.store.update_status(&message.namespace, &cc).await {
            Ok(_) => {
                tracing::info!(
                    cluster = %message.cluster,
                    dc_rack = %message.dc_rack,
                    pod = %message.pod,
                    operation = %message.operation,
                    status = %outcome,
                    "Operation finished"
                );
                return;
            }
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                tracing::debug!(cluster = %message.cluster, error = %e, "Cannot record operation result, retrying");
                tokio::time::sleep(ctx.config.retry_interval()).await;
            }
        }
    }
}
