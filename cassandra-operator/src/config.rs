//! Operator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the reconcile loop and its background tasks.
///
/// Every timing decision of the controller reads from here so tests can
/// shrink the waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Identity recorded on pod operations (the operator pod name).
    pub operator_name: String,

    /// Grace window after an action started before it is re-evaluated.
    pub delay_wait_secs: u64,

    /// Time a node may stay NORMAL after a decommission before it is retried.
    pub decommission_delay_secs: u64,

    /// Poll interval of pod-operation monitors.
    pub monitor_interval_ms: u64,

    /// Backoff between finalize retries.
    pub retry_interval_ms: u64,

    /// Maximum wait for a PVC to disappear after deletion.
    pub pvc_delete_timeout_ms: u64,

    /// Poll interval while waiting for a StatefulSet update to land.
    pub sts_update_poll_ms: u64,

    /// Maximum wait for a StatefulSet update to land.
    pub sts_update_timeout_ms: u64,

    /// Capacity of the finalize channel.
    pub finalize_queue_capacity: usize,

    /// Port of the Jolokia agent on Cassandra pods.
    pub jolokia_port: u16,

    /// Requeue delay after a normal pass.
    pub requeue_secs: u64,

    /// Requeue delay after a blocked change.
    pub blocked_requeue_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_name: String::new(),
            delay_wait_secs: 20,
            decommission_delay_secs: 120,
            monitor_interval_ms: 10_000,
            retry_interval_ms: 1_000,
            pvc_delete_timeout_ms: 30_000,
            sts_update_poll_ms: 1_000,
            sts_update_timeout_ms: 5_000,
            finalize_queue_capacity: 64,
            jolokia_port: 8778,
            requeue_secs: 5,
            blocked_requeue_secs: 30,
        }
    }
}

impl OperatorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> OperatorConfigBuilder {
        OperatorConfigBuilder::default()
    }

    /// Load defaults overridden by the process environment.
    ///
    /// - `POD_NAME`: operator identity
    /// - `OPERATOR_JOLOKIA_PORT`: Jolokia port
    /// - `OPERATOR_FINALIZE_QUEUE`: finalize channel capacity
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("POD_NAME") {
            config.operator_name = name;
        }
        if let Ok(port) = std::env::var("OPERATOR_JOLOKIA_PORT") {
            config.jolokia_port = port
                .parse()
                .map_err(|e| format!("invalid OPERATOR_JOLOKIA_PORT {port:?}: {e}"))?;
        }
        if let Ok(cap) = std::env::var("OPERATOR_FINALIZE_QUEUE") {
            config.finalize_queue_capacity = cap
                .parse()
                .map_err(|e| format!("invalid OPERATOR_FINALIZE_QUEUE {cap:?}: {e}"))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.finalize_queue_capacity == 0 {
            return Err("finalize_queue_capacity must be > 0".to_string());
        }
        if self.jolokia_port == 0 {
            return Err("jolokia_port must be > 0".to_string());
        }
        if self.sts_update_poll_ms == 0 || self.retry_interval_ms == 0 {
            return Err("poll intervals must be > 0".to_string());
        }
        Ok(())
    }

    /// Grace window as a chrono duration.
    pub fn delay_wait(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delay_wait_secs as i64)
    }

    /// Decommission retry delay as a chrono duration.
    pub fn decommission_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.decommission_delay_secs as i64)
    }

    /// Monitor poll interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Finalize retry backoff.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// PVC deletion timeout.
    pub fn pvc_delete_timeout(&self) -> Duration {
        Duration::from_millis(self.pvc_delete_timeout_ms)
    }

    /// StatefulSet update poll interval.
    pub fn sts_update_poll(&self) -> Duration {
        Duration::from_millis(self.sts_update_poll_ms)
    }

    /// StatefulSet update timeout.
    pub fn sts_update_timeout(&self) -> Duration {
        Duration::from_millis(self.sts_update_timeout_ms)
    }

    /// Requeue delay after a normal pass.
    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    /// Requeue delay after a blocked change.
    pub fn blocked_requeue(&self) -> Duration {
        Duration::from_secs(self.blocked_requeue_secs)
    }
}

/// Builder for OperatorConfig.
#[derive(Debug, Default)]
pub struct OperatorConfigBuilder {
    config: OperatorConfig,
}

impl OperatorConfigBuilder {
    /// Set the operator identity.
    pub fn operator_name(mut self, name: impl Into<String>) -> Self {
        self.config.operator_name = name.into();
        self
    }

    /// Set the action grace window in seconds.
    pub fn delay_wait_secs(mut self, secs: u64) -> Self {
        self.config.delay_wait_secs = secs;
        self
    }

    /// Set the decommission retry delay in seconds.
    pub fn decommission_delay_secs(mut self, secs: u64) -> Self {
        self.config.decommission_delay_secs = secs;
        self
    }

    /// Set the monitor poll interval in milliseconds.
    pub fn monitor_interval_ms(mut self, ms: u64) -> Self {
        self.config.monitor_interval_ms = ms;
        self
    }

    /// Set the finalize retry interval in milliseconds.
    pub fn retry_interval_ms(mut self, ms: u64) -> Self {
        self.config.retry_interval_ms = ms;
        self
    }

    /// Set the PVC deletion timeout in milliseconds.
    pub fn pvc_delete_timeout_ms(mut self, ms: u64) -> Self {
        self.config.pvc_delete_timeout_ms = ms;
        self
    }

    /// Set the StatefulSet update poll and timeout in milliseconds.
    pub fn sts_update_wait_ms(mut self, poll: u64, timeout: u64) -> Self {
        self.config.sts_update_poll_ms = poll;
        self.config.sts_update_timeout_ms = timeout;
        self
    }

    /// Set the finalize channel capacity.
    pub fn finalize_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.finalize_queue_capacity = capacity;
        self
    }

    /// Set the Jolokia port.
    pub fn jolokia_port(mut self, port: u16) -> Self {
        self.config.jolokia_port = port;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<OperatorConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operational_constants() {
        let config = OperatorConfig::default();
        assert_eq!(config.delay_wait(), chrono::Duration::seconds(20));
        assert_eq!(config.decommission_delay(), chrono::Duration::seconds(120));
        assert_eq!(config.monitor_interval(), Duration::from_secs(10));
        assert_eq!(config.pvc_delete_timeout(), Duration::from_secs(30));
        assert_eq!(config.jolokia_port, 8778);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_rejects_empty_queue() {
        let result = OperatorConfig::builder().finalize_queue_capacity(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = OperatorConfig::builder()
            .operator_name("op-0")
            .monitor_interval_ms(5)
            .retry_interval_ms(5)
            .build()
            .unwrap();
        assert_eq!(config.operator_name, "op-0");
        assert_eq!(config.monitor_interval(), Duration::from_millis(5));
    }
}
