//! TaskPilot REST endpoints used by background sync.

use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::ApiConfig;
use crate::queue::MutationKind;

use super::client::{Network, NetworkError};
use super::types::{Request, Response};

/// Thin wrapper resolving API paths against the app origin
#[derive(Clone)]
pub struct RemoteApi {
  network: Arc<dyn Network>,
  origin: Url,
  config: ApiConfig,
}

impl RemoteApi {
  pub fn new(network: Arc<dyn Network>, origin: Url, config: ApiConfig) -> Self {
    Self {
      network,
      origin,
      config,
    }
  }

  fn endpoint(&self, path: &str) -> Result<Url, NetworkError> {
    self
      .origin
      .join(path)
      .map_err(|e| NetworkError::Transport(format!("invalid endpoint {}: {}", path, e)))
  }

  /// POST a queued mutation to the creation endpoint for its kind
  pub async fn create(&self, kind: MutationKind, payload: &Value) -> Result<Response, NetworkError> {
    let path = match kind {
      MutationKind::Task => &self.config.tasks_endpoint,
      MutationKind::Note => &self.config.notes_endpoint,
    };
    let url = self.endpoint(path)?;
    let body = serde_json::to_vec(payload)
      .map_err(|e| NetworkError::Transport(format!("failed to encode payload: {}", e)))?;

    self.network.fetch(&Request::post_json(url, body)).await
  }

  /// GET a read-only resource
  pub async fn get(&self, path: &str) -> Result<(Url, Response), NetworkError> {
    let url = self.endpoint(path)?;
    let response = self.network.fetch(&Request::get(url.clone())).await?;
    Ok((url, response))
  }
}
