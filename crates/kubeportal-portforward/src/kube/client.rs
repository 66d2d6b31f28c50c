use async_trait::async_trait;
use kube::config::KubeConfigOptions;
use kube::{
    Client,
    Config,
};

use crate::error::ForwardError;

/// Creates API clients for a kubeconfig context. Injectable so tests can
/// substitute mock transports.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, context: &str) -> Result<Client, ForwardError>;
}

/// Default factory: resolves the named context through the standard
/// kubeconfig discovery chain.
pub struct KubeconfigClientFactory;

#[async_trait]
impl ClientFactory for KubeconfigClientFactory {
    async fn create(&self, context: &str) -> Result<Client, ForwardError> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };

        let config = Config::from_kubeconfig(&options).await.map_err(|e| {
            ForwardError::Kubernetes(format!(
                "failed to load kubeconfig for context '{context}': {e}"
            ))
        })?;

        Client::try_from(config).map_err(|e| {
            ForwardError::Kubernetes(format!(
                "failed to create client for context '{context}': {e}"
            ))
        })
    }
}
