use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;

use super::types::{Request, Response};

/// Why a request never produced a response
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("request timed out")]
  Timeout,
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("transport error: {0}")]
  Transport(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      NetworkError::Timeout
    } else if e.is_connect() {
      NetworkError::Connect(e.to_string())
    } else {
      NetworkError::Transport(e.to_string())
    }
  }
}

/// The outbound network, as far as the offline layer is concerned.
///
/// A resolved `Ok` means the server answered (with any status); `Err` means
/// the network itself failed.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if let Some(content_type) = &request.content_type {
      builder = builder.header(CONTENT_TYPE, content_type);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder.send().await?;

    let status = resp.status().as_u16();
    let content_type = resp
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = resp.bytes().await?.to_vec();

    Ok(Response {
      status,
      content_type,
      body,
    })
  }
}
