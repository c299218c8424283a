use std::path::Path;
use std::time::Duration;

use crate::error::Error;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Base URL of the Kubernetes API server
    pub api_url: String,

    /// Namespace Jobs are created in
    pub namespace: String,

    /// Bearer token for authentication
    pub token: Option<String>,

    /// PEM encoded CA bundle used to verify the API server
    pub ca_cert: Option<Vec<u8>>,

    /// Timeout applied to each individual API request
    pub request_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(api_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token: None,
            ca_cert: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Build a configuration from the service account mounted into every pod.
    ///
    /// The namespace falls back to the pod's own namespace when `namespace` is `None`.
    pub fn in_cluster(namespace: Option<String>) -> Result<Self, Error> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Configuration("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))?;
        let ca_cert = std::fs::read(dir.join("ca.crt"))?;
        let namespace = match namespace {
            Some(ns) => ns,
            None => std::fs::read_to_string(dir.join("namespace"))?
                .trim()
                .to_string(),
        };

        Ok(Self::new(format!("https://{}:{}", host, port), namespace)
            .with_token(token.trim())
            .with_ca_cert(ca_cert))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert = Some(pem);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
