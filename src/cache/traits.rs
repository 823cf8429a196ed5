//! Core types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::remote::Response;

/// Canonical identity of a cached request: the absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn from_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(url.into())
  }

  /// Resolve a path or absolute URL against the app origin.
  pub fn resolve(origin: &Url, raw: &str) -> Result<Self> {
    let url = origin
      .join(raw)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", raw, e))?;
    Ok(Self::from_url(&url))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(response: &Response) -> Self {
    Self {
      status: response.status,
      content_type: response.content_type.clone(),
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      content_type: self.content_type.clone(),
      body: self.body.clone(),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from a cache partition.
  pub fn from_cache(data: T, source: CacheSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
    }
  }

  /// Data produced locally, not from network or cache.
  pub fn synthesized(data: T, source: CacheSource) -> Self {
    Self {
      data,
      source,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh response from the network
  Network,
  /// Network failed, served from the dynamic partition
  Dynamic,
  /// Network failed, served from the static partition
  Static,
  /// Network failed on a navigation, served the offline document
  OfflinePage,
  /// Network failed and nothing was cached
  Placeholder,
  /// Liveness check, answered locally
  HealthCheck,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_strips_fragment_and_resolves_relative() {
    let origin = Url::parse("http://localhost:8080").unwrap();
    let a = RequestKey::resolve(&origin, "/index.html#top").unwrap();
    let b = RequestKey::resolve(&origin, "http://localhost:8080/index.html").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "http://localhost:8080/index.html");
  }

  #[test]
  fn test_key_keeps_query_string() {
    let origin = Url::parse("http://localhost:8080").unwrap();
    let a = RequestKey::resolve(&origin, "/api/tasks?week=1").unwrap();
    let b = RequestKey::resolve(&origin, "/api/tasks?week=2").unwrap();
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_cache_hash_is_stable_hex() {
    let origin = Url::parse("http://localhost:8080").unwrap();
    let key = RequestKey::resolve(&origin, "/").unwrap();
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, key.cache_hash());
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn test_entry_round_trips_response_bytes() {
    let response = Response::new(200, Some("image/png"), vec![0x89, 0x50, 0x4e, 0x47]);
    let entry = CacheEntry::from_response(&response);
    assert_eq!(entry.to_response(), response);
  }
}
