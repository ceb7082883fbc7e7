//! Prometheus gauges exported by the operator.
//!
//! # Metrics
//!
//! - `cassandra_operator_cluster_phase{cluster}`: 1 Initializing, 2 Running, 3 Pending
//! - `cassandra_operator_cluster_action{cluster}`: id of the last cluster action

use crate::crd::{ActionKind, ClusterPhase};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

/// Operator metrics registry.
pub struct Metrics {
    registry: Registry,
    /// Phase of each cluster.
    pub cluster_phase: IntGaugeVec,
    /// Last action of each cluster.
    pub cluster_action: IntGaugeVec,
}

impl Metrics {
    /// Create and register the gauges.
    pub fn new() -> Self {
        let registry = Registry::new();

        let cluster_phase = IntGaugeVec::new(
            Opts::new("cluster_phase", "Phase of the Cassandra cluster")
                .namespace("cassandra_operator"),
            &["cluster"],
        )
        .expect("metric creation should not fail");

        let cluster_action = IntGaugeVec::new(
            Opts::new("cluster_action", "Last action applied to the Cassandra cluster")
                .namespace("cassandra_operator"),
            &["cluster"],
        )
        .expect("metric creation should not fail");

        registry
            .register(Box::new(cluster_phase.clone()))
            .expect("metric registration should not fail");
        registry
            .register(Box::new(cluster_action.clone()))
            .expect("metric registration should not fail");

        Self {
            registry,
            cluster_phase,
            cluster_action,
        }
    }

    /// Record a cluster phase.
    pub fn set_phase(&self, cluster: &str, phase: ClusterPhase) {
        self.cluster_phase
            .with_label_values(&[cluster])
            .set(phase.id());
    }

    /// Record a cluster action.
    pub fn set_action(&self, cluster: &str, action: ActionKind) {
        self.cluster_action
            .with_label_values(&[cluster])
            .set(action.id());
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
