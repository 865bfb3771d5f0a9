mod client;
mod error;
mod types;

pub use client::RestClient;
pub use error::RestError;

use async_trait::async_trait;

use super::{Provider, ProviderError, ProviderResponse, ResourceRequest};
use crate::resource::ResourceId;
use types::{RemoteResource, ResourceBody};

/// Provider backed by a JSON provisioning API.
///
/// `POST /resources/{type}` creates, `GET|PUT|DELETE /resources/{type}/{id}`
/// read, update and delete. Every type is routed to the same endpoint.
#[derive(Debug)]
pub struct RestProvider {
    client: RestClient,
}

impl RestProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RestError> {
        Ok(Self {
            client: RestClient::new(base_url, token)?,
        })
    }

    pub fn client(&self) -> &RestClient {
        &self.client
    }
}

fn body<'a>(request: &ResourceRequest<'a>) -> ResourceBody<'a> {
    ResourceBody {
        name: &request.id.name,
        key: request.id.key.as_ref(),
        attributes: request.attributes,
    }
}

fn into_response(remote: RemoteResource) -> ProviderResponse {
    ProviderResponse {
        provider_id: remote.id,
        outputs: remote.outputs,
    }
}

#[async_trait]
impl Provider for RestProvider {
    fn name(&self) -> &str {
        "rest"
    }

    async fn create(&self, request: ResourceRequest<'_>) -> Result<ProviderResponse, ProviderError> {
        let remote = self
            .client
            .create(&request.id.resource_type, &body(&request))
            .await?;
        tracing::debug!(resource = %request.id, provider_id = %remote.id, "remote create confirmed");
        Ok(into_response(remote))
    }

    async fn read(
        &self,
        id: &ResourceId,
        provider_id: &str,
    ) -> Result<Option<ProviderResponse>, ProviderError> {
        let remote = self.client.get(&id.resource_type, provider_id).await?;
        Ok(remote.map(into_response))
    }

    async fn update(
        &self,
        provider_id: &str,
        request: ResourceRequest<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        let remote = self
            .client
            .update(&request.id.resource_type, provider_id, &body(&request))
            .await?;
        Ok(into_response(remote))
    }

    async fn delete(&self, id: &ResourceId, provider_id: &str) -> Result<(), ProviderError> {
        self.client.delete(&id.resource_type, provider_id).await?;
        Ok(())
    }
}
