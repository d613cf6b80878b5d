use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Patch => f.write_str("PATCH"),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid URL {0:?}")]
    InvalidUrl(String),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Failed to get response from {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Sends a JSON document and hands back the raw response body.
///
/// The body is returned whatever the status code; callers decide what a
/// response means.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<String, HttpError>;
}

/// Convenience verbs over a shared transport
#[derive(Clone)]
pub struct JsonClient {
    transport: Arc<dyn JsonTransport>,
}

impl JsonClient {
    pub fn new(transport: Arc<dyn JsonTransport>) -> Self {
        Self { transport }
    }

    pub async fn post(&self, url: &str, body: &[u8]) -> Result<String, HttpError> {
        self.transport.request(Method::Post, url, Some(body)).await
    }

    pub async fn patch(&self, url: &str, body: &[u8]) -> Result<String, HttpError> {
        self.transport.request(Method::Patch, url, Some(body)).await
    }

    pub async fn get(&self, url: &str) -> Result<String, HttpError> {
        self.transport.request(Method::Get, url, None).await
    }

    /// GET carrying a JSON body, as the SPF service expects
    pub async fn get_with_body(&self, url: &str, body: &[u8]) -> Result<String, HttpError> {
        self.transport.request(Method::Get, url, Some(body)).await
    }
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl JsonTransport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<String, HttpError> {
        let parsed = Url::parse(url).map_err(|_| HttpError::InvalidUrl(url.to_string()))?;

        info!(
            "Request: [{} {}] {}",
            method,
            url,
            String::from_utf8_lossy(body.unwrap_or_default())
        );

        let mut request = self
            .client
            .request(method.into(), parsed)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let transport_error = |e: reqwest::Error| HttpError::Transport {
            url: url.to_string(),
            source: Box::new(e),
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!("Response headers from {}: {:?}", url, response.headers());
        let text = response.text().await.map_err(transport_error)?;
        info!("Response: [{}] {}", status, text);

        Ok(text)
    }
}
