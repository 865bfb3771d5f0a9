use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Response, StatusCode};

use super::RestError;
use super::types::{ApiResponse, RemoteResource, ResourceBody};

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RestError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let header_value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                RestError::Auth {
                    message: "Invalid token format".to_string(),
                }
            })?;
            headers.insert(AUTHORIZATION, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(RestError::Network)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, resource_type: &str) -> String {
        format!(
            "{}/resources/{}",
            self.base_url,
            urlencoding::encode(resource_type)
        )
    }

    fn object_url(&self, resource_type: &str, provider_id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(resource_type),
            urlencoding::encode(provider_id)
        )
    }

    pub async fn create(
        &self,
        resource_type: &str,
        body: &ResourceBody<'_>,
    ) -> Result<RemoteResource, RestError> {
        let url = self.collection_url(resource_type);
        let response = self.client.post(&url).json(body).send().await?;
        Self::parse_resource(response, resource_type).await
    }

    pub async fn get(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> Result<Option<RemoteResource>, RestError> {
        let url = self.object_url(resource_type, provider_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_resource(response, resource_type).await.map(Some)
    }

    pub async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        body: &ResourceBody<'_>,
    ) -> Result<RemoteResource, RestError> {
        let url = self.object_url(resource_type, provider_id);
        let response = self.client.put(&url).json(body).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RestError::NotFound {
                resource: format!("{}/{}", resource_type, provider_id),
            });
        }
        Self::parse_resource(response, resource_type).await
    }

    // NOTE: A 404 means the object is already gone, which is what delete wants.
    pub async fn delete(&self, resource_type: &str, provider_id: &str) -> Result<(), RestError> {
        let url = self.object_url(resource_type, provider_id);
        let response = self.client.delete(&url).send().await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::error_from(response).await)
    }

    async fn parse_resource(
        response: Response,
        resource_type: &str,
    ) -> Result<RemoteResource, RestError> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let status = response.status();
        let body: ApiResponse<RemoteResource> =
            response.json().await.map_err(|e| RestError::Api {
                status: status.as_u16(),
                message: format!("Failed to parse response: {}", e),
            })?;

        if !body.success {
            return Err(RestError::Api {
                status: status.as_u16(),
                message: body.first_error().unwrap_or("Unknown error").to_string(),
            });
        }

        body.result.ok_or_else(|| {
            RestError::InvalidResponse(format!("{} response carried no result", resource_type))
        })
    }

    async fn error_from(response: Response) -> RestError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return RestError::RateLimited { retry_after };
        }

        let message = response
            .json::<ApiResponse<serde_json::Value>>()
            .await
            .ok()
            .and_then(|body| body.first_error().map(str::to_string))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            });

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RestError::Auth { message },
            _ => RestError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}
