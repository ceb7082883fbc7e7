//! Jolokia credentials and the production [`NodeControlFactory`].

use super::{JolokiaClient, NodeControl, NodeControlFactory, pod_host};
use crate::crd::CassandraCluster;
use crate::error::{OperatorError, OperatorResult};
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Credentials read from a Kubernetes secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Basic authentication (username:password).
    BasicAuth {
        /// Username for basic authentication.
        username: String,
        /// Password for basic authentication.
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::BasicAuth { username, .. } => f
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Resolves credentials from secrets through the object store.
pub struct CredentialsResolver<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> CredentialsResolver<S> {
    /// Create a new credentials resolver.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Read `username` and `password` from the secret.
    pub async fn resolve(&self, secret_name: &str, namespace: &str) -> OperatorResult<Credentials> {
        tracing::debug!(
            secret = %secret_name,
            namespace = %namespace,
            "Resolving Jolokia credentials from secret"
        );

        let secret: Secret = self.store.get(namespace, secret_name).await?;
        let data = secret.data.ok_or_else(|| {
            OperatorError::InvalidConfig(format!("Secret '{secret_name}' has no data field"))
        })?;

        let username = parse_secret_string(&data, "username", secret_name)?;
        let password = parse_secret_string(&data, "password", secret_name)?;
        Ok(Credentials::BasicAuth { username, password })
    }
}

fn parse_secret_string(
    data: &BTreeMap<String, ByteString>,
    key: &str,
    secret_name: &str,
) -> OperatorResult<String> {
    let bytes = data.get(key).ok_or_else(|| {
        OperatorError::InvalidConfig(format!("Secret '{secret_name}' missing '{key}' field"))
    })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| {
        OperatorError::InvalidConfig(format!(
            "Secret '{secret_name}' contains invalid UTF-8 in '{key}' field"
        ))
    })
}

/// Builds [`JolokiaClient`]s, authenticated with the cluster's Jolokia secret.
pub struct JolokiaFactory<S> {
    credentials: CredentialsResolver<S>,
    port: u16,
}

impl<S: ObjectStore> JolokiaFactory<S> {
    /// Create a factory for agents listening on `port`.
    pub fn new(store: Arc<S>, port: u16) -> Self {
        Self {
            credentials: CredentialsResolver::new(store),
            port,
        }
    }
}

#[async_trait]
impl<S: ObjectStore> NodeControlFactory for JolokiaFactory<S> {
    async fn connect(
        &self,
        cluster: &CassandraCluster,
        pod: &Pod,
    ) -> OperatorResult<Arc<dyn NodeControl>> {
        let host = pod_host(pod).ok_or_else(|| {
            OperatorError::NodeControl(format!("pod {} has no address yet", pod.name_any()))
        })?;
        let mut client = JolokiaClient::new(host, self.port)?;

        if let Some(secret) = cluster.spec.image_jolokia_secret.as_deref() {
            let namespace = cluster.namespace().unwrap_or_default();
            let Credentials::BasicAuth { username, password } =
                self.credentials.resolve(secret, &namespace).await?;
            client = client.with_basic_auth(username, password);
        }
        Ok(Arc::new(client))
    }
}
