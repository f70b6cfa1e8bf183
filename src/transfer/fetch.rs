use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Remote responded with status {0}")]
    Status(u16),
    #[error("Remote file exceeds maximum size of {max} bytes")]
    TooLarge { max: u64 },
}

impl FetchError {
    /// Oversized responses are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::TooLarge { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Retrieves a remote resource for the remote-fetch worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError>;
}

/// Fetches over HTTP(S) with reqwest.
pub struct HttpFetcher {
    client: Client,
    max_size: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_size: u64) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("file-lifecycle/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, max_size })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        if resp.content_length().is_some_and(|len| len > self.max_size) {
            return Err(FetchError::TooLarge { max: self.max_size });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
            .filter(|v| !v.is_empty());

        // Content-Length may be absent or wrong; enforce the limit while reading.
        let mut buf = BytesMut::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?
        {
            if (buf.len() + chunk.len()) as u64 > self.max_size {
                return Err(FetchError::TooLarge { max: self.max_size });
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchedFile {
            data: buf.freeze(),
            content_type,
        })
    }
}
