//! Error types for the Cassandra operator.

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Resource already exists.
    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// Optimistic concurrency failure: the stored resourceVersion moved.
    #[error("Conflict while writing {kind}/{name}")]
    Conflict {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cluster validation error.
    #[error("Cluster validation failed: {0}")]
    ValidationError(String),

    /// Error reported by a Cassandra node's management endpoint.
    #[error("Node control error: {0}")]
    NodeControl(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    /// Whether the error is a resourceVersion conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } => true,
            OperatorError::KubeError(kube::Error::Api(err)) => err.code == 409 && err.reason == "Conflict",
            _ => false,
        }
    }

    /// Whether the error means the object is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            OperatorError::AlreadyExists { .. } => true,
            OperatorError::KubeError(kube::Error::Api(err)) => {
                err.code == 409 && err.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::NodeControl(err.to_string())
    }
}
