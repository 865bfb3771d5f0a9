pub mod rest;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{Attributes, ResourceId};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("resource type '{0}' is not supported")]
    UnsupportedResourceType(String),
    #[error("request rejected: {message}")]
    Rejected { message: String },
    /// `retry_after` carries the remote side's requested wait, if it sent one.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote object not found: {resource}")]
    NotFound { resource: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether the same call may succeed if repeated within this run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Everything a provider needs to create or update one resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequest<'a> {
    pub id: &'a ResourceId,
    pub attributes: &'a Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub provider_id: String,
    pub outputs: Attributes,
}

impl ProviderResponse {
    /// Outputs with the provider id exposed as the `id` attribute.
    pub fn into_outputs(self) -> (String, Attributes) {
        let mut outputs = self.outputs;
        outputs
            .entry("id".to_string())
            .or_insert_with(|| serde_json::Value::String(self.provider_id.clone()));
        (self.provider_id, outputs)
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the registry may route `resource_type` here.
    fn supports(&self, _resource_type: &str) -> bool {
        true
    }

    async fn create(&self, request: ResourceRequest<'_>) -> Result<ProviderResponse, ProviderError>;

    /// `Ok(None)` when the remote object no longer exists.
    async fn read(
        &self,
        id: &ResourceId,
        provider_id: &str,
    ) -> Result<Option<ProviderResponse>, ProviderError>;

    async fn update(
        &self,
        provider_id: &str,
        request: ResourceRequest<'_>,
    ) -> Result<ProviderResponse, ProviderError>;

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

pub fn get_provider(
    name: &str,
    settings: &ProviderSettings,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match name {
        "simulated" => Ok(Arc::new(simulated::SimulatedProvider::new())),
        "rest" => {
            let endpoint = settings.endpoint.clone().ok_or_else(|| {
                ProviderError::Config(
                    "No endpoint provided. Set GROUNDWORK_ENDPOINT or use --endpoint flag"
                        .to_string(),
                )
            })?;
            let provider = rest::RestProvider::new(endpoint, settings.token.clone())
                .map_err(ProviderError::from)?;
            Ok(Arc::new(provider))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

/// Routes each resource type to the first registered provider that supports it.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        tracing::debug!(provider = provider.name(), "provider registered");
        self.providers.push(provider);
    }

    pub fn provider_for(&self, resource_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.supports(resource_type))
            .cloned()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}
