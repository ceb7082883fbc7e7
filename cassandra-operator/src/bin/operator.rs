//! Cassandra Kubernetes Operator binary.
//!
//! Watches CassandraCluster resources in every namespace and reconciles them
//! with the controller of the `cassandra_operator` crate.

use cassandra_operator::controller::{
    CassandraClusterController, ControllerContext, ReconcileAction, error_policy,
};
use cassandra_operator::crd::CassandraCluster;
use cassandra_operator::node_control::JolokiaFactory;
use cassandra_operator::store::KubeStore;
use cassandra_operator::OperatorConfig;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cassandra_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    let config = OperatorConfig::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!(operator = %config.operator_name, "Starting Cassandra Kubernetes Operator");

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let store = Arc::new(KubeStore::new(client.clone()));
    let nodes = Arc::new(JolokiaFactory::new(store.clone(), config.jolokia_port));
    let ctx = Arc::new(ControllerContext::new(store, nodes, config));
    let controller = CassandraClusterController::new(ctx.clone());

    run_controller(client, controller.clone(), ctx).await;

    tracing::info!("Waiting for pod operations to stop");
    controller.shutdown().await;
    Ok(())
}

/// Run the CassandraCluster controller until a termination signal.
async fn run_controller(
    client: Client,
    controller: CassandraClusterController<KubeStore>,
    ctx: Arc<ControllerContext<KubeStore>>,
) {
    let clusters: Api<CassandraCluster> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client);

    Controller::new(clusters, WatcherConfig::default())
        .owns(statefulsets, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            move |cluster, _ctx| {
                let controller = controller.clone();
                async move {
                    match controller.reconcile(cluster).await {
                        Ok(ReconcileAction::Requeue(duration)) => Ok(Action::requeue(duration)),
                        Ok(ReconcileAction::Done) => Ok(Action::await_change()),
                        Err(e) => {
                            tracing::error!(error = %e, "Cluster reconciliation error");
                            Ok(Action::requeue(Duration::from_secs(30)))
                        }
                    }
                }
            },
            error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(cluster = %obj.name, ?action, "Reconciled cluster");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cluster controller stream error");
                }
            }
        })
        .await;
}

/// Print the CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&CassandraCluster::crd())?);
    Ok(())
}
