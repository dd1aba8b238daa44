//! HTTP client implementation

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::AgentError;

/// HTTP client for the deployment server
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClient {
    /// Create a new HTTP client, authenticating with `token` when given
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn check(method: &str, response: Response) -> Result<Response, AgentError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("HTTP {} failed: {} - {}", method, status, body);
        Err(AgentError::ApiError {
            status: status.as_u16(),
            message: body,
        })
    }

    /// Make a POST request; `None` when the server has no content for us
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, AgentError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let request = self.authorize(self.client.post(&url).json(body));
        let response = Self::check("POST", request.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.json().await?;
        Ok(Some(body))
    }

    /// Make a PUT request, ignoring any response body
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<(), AgentError> {
        let url = self.url(path);
        debug!("PUT {}", url);

        let request = self.authorize(self.client.put(&url).json(body));
        Self::check("PUT", request.send().await?).await?;
        Ok(())
    }
}
