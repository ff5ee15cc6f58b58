use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else if error.is_connect() {
            FetchError::Connect(error.to_string())
        } else if let Some(status) = error.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Other(error.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Head,
    Get,
}

impl ProbeMethod {
    fn as_method(self) -> Method {
        match self {
            ProbeMethod::Head => Method::HEAD,
            ProbeMethod::Get => Method::GET,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeResponse {
    pub status: u16,
    /// Lowercased `content-type` header, when present.
    pub content_type: Option<String>,
}

impl ProbeResponse {
    pub fn content_type_contains(&self, needle: &str) -> bool {
        self.content_type
            .as_deref()
            .map(|value| value.contains(needle))
            .unwrap_or(false)
    }
}

/// Network capability used by source validation and playlist inspection.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn probe(
        &self,
        url: &str,
        method: ProbeMethod,
        timeout: Duration,
    ) -> Result<ProbeResponse, FetchError>;

    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|err| FetchError::Other(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn probe(
        &self,
        url: &str,
        method: ProbeMethod,
        timeout: Duration,
    ) -> Result<ProbeResponse, FetchError> {
        let response = self
            .client
            .request(method.as_method(), url)
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_lowercase);
        // GET bodies are dropped unread; only the headers matter here.
        Ok(ProbeResponse {
            status,
            content_type,
        })
    }

    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}
