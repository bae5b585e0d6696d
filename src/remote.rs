use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::domain::Record;
use crate::error::SyncError;
use crate::source::{DataSource, decode_records};

pub const DEFAULT_BASE_URL: &str = "https://msi.nga.mil/api";

/// Remote endpoint consumed by fetch tasks.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, source: &DataSource) -> Result<Vec<Record>, SyncError>;
}

#[derive(Clone)]
pub struct HttpRemoteSource {
    client: Client,
    base_url: String,
}

impl HttpRemoteSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .default_headers(default_headers()?)
            .build()
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, source: &DataSource) -> String {
        format!("{}{}", self.base_url, source.path)
    }

    async fn handle_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "remote request failed".to_string());
        Err(SyncError::Status { status, message })
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(&self, source: &DataSource) -> Result<Vec<Record>, SyncError> {
        let url = self.endpoint(source);
        debug!(source = %source.key, %url, "requesting feed");
        let response = self
            .client
            .get(&url)
            .query(&source.query_params())
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        let response = Self::handle_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| SyncError::Decode(err.to_string()))?;
        Ok(decode_records(source, &body)?.records)
    }
}

pub(crate) fn default_headers() -> Result<HeaderMap, SyncError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("msi-sync/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| SyncError::Transport(err.to_string()))?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Ok(headers)
}
