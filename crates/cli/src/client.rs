//! API client for the lifecycle agent

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Runs can take minutes on large clouds
const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Error body returned by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API error ({status}): {message}")]
    Status { status: StatusCode, message: String },
}

/// API client for the lifecycle agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        Err(ApiError::Status { status, message }.into())
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// GET that also accepts 503, which probes use to report bad health
    pub async fn probe<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return response.json().await.context("Failed to parse response");
        }
        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// POST without a body, waiting as long as a run may take
    pub async fn post<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .query(query)
            .timeout(RUN_TIMEOUT)
            .send()
            .await
            .context("Failed to send request")?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::Value;

    #[tokio::test]
    async fn test_get_returns_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/report")
            .with_status(200)
            .with_body(r#"{"dry_run": true}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let body: Value = client.get("api/v1/report").await.unwrap();

        assert_eq!(body["dry_run"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/report")
            .with_status(404)
            .with_body(r#"{"error": "No lifecycle run has completed yet"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.get::<Value>("api/v1/report").await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "API error (404 Not Found): No lifecycle run has completed yet"
        );
    }

    #[tokio::test]
    async fn test_probe_accepts_unavailable() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_body(r#"{"status": "unhealthy", "components": {}}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let body: Value = client.probe("healthz").await.unwrap();

        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_post_sends_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/runs")
            .match_query(Matcher::UrlEncoded("dry_run".into(), "false".into()))
            .with_status(200)
            .with_body(r#"{"dry_run": false}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let body: Value = client
            .post("api/v1/runs", &[("dry_run", "false".to_string())])
            .await
            .unwrap();

        assert_eq!(body["dry_run"], false);
        mock.assert_async().await;
    }
}
