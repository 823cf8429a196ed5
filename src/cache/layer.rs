//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::remote::{NetworkError, Response};

use super::partition::PartitionVersion;
use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult, CacheSource, RequestKey};

/// Outcome of a network-first fetch that produced a response.
#[derive(Debug)]
pub enum NetworkFirst {
  /// The network answered. `persist` is the detached write into the
  /// dynamic partition, present only when the response was cacheable.
  Network {
    response: Response,
    persist: Option<JoinHandle<()>>,
  },
  /// The network failed and the cache had the request.
  Cached(CacheResult<Response>),
}

/// Cache layer over the served generation's partitions.
///
/// Only the served static and dynamic partitions are ever read or written
/// here; which generation that is, and pruning the others, is the
/// lifecycle's job.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  version: watch::Receiver<PartitionVersion>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Cache layer pinned to one generation.
  #[cfg(test)]
  pub fn new(storage: Arc<S>, version: PartitionVersion) -> Self {
    Self::following(storage, watch::channel(version).1)
  }

  /// Cache layer that tracks the generation published by the lifecycle.
  pub fn following(storage: Arc<S>, version: watch::Receiver<PartitionVersion>) -> Self {
    Self { storage, version }
  }

  fn served(&self) -> PartitionVersion {
    self.version.borrow().clone()
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Find a request in the current partitions, dynamic first.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CacheResult<Response>>> {
    let version = self.served();
    let dynamic = version.dynamic_partition();
    if let Some(entry) = self.storage.get(&dynamic, key)? {
      return Ok(Some(CacheResult::from_cache(
        entry.to_response(),
        CacheSource::Dynamic,
        entry.stored_at,
      )));
    }

    let static_partition = version.static_partition();
    if let Some(entry) = self.storage.get(&static_partition, key)? {
      return Ok(Some(CacheResult::from_cache(
        entry.to_response(),
        CacheSource::Static,
        entry.stored_at,
      )));
    }

    Ok(None)
  }

  /// Overwrite a dynamic entry and wait for the write.
  pub fn store_dynamic(&self, key: &RequestKey, response: &Response) -> Result<()> {
    let entry = CacheEntry::from_response(response);
    self
      .storage
      .put(&self.served().dynamic_partition(), key, &entry)
  }

  /// Overwrite a dynamic entry without making the caller wait.
  ///
  /// The write runs on the blocking pool; failures are logged only.
  pub fn store_dynamic_detached(&self, key: RequestKey, response: &Response) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let partition = self.served().dynamic_partition();
    let entry = CacheEntry::from_response(response);

    tokio::task::spawn_blocking(move || match storage.put(&partition, &key, &entry) {
      Ok(()) => debug!(%key, %partition, "cached response"),
      Err(e) => warn!(%key, %partition, error = %e, "failed to cache response"),
    })
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Ask the network
  /// 2. If it answers, return that answer; a 200 is also copied into the
  ///    dynamic partition in the background
  /// 3. If the network fails, serve the cached copy (dynamic, then static)
  /// 4. If nothing is cached, hand the network error back to the caller
  ///
  /// A storage error during the fallback lookup counts as a miss.
  pub async fn fetch_network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<NetworkFirst, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, NetworkError>>,
  {
    match fetcher().await {
      Ok(response) => {
        let persist = response
          .is_cacheable()
          .then(|| self.store_dynamic_detached(key.clone(), &response));
        Ok(NetworkFirst::Network { response, persist })
      }
      Err(network_error) => {
        debug!(%key, error = %network_error, "network failed, trying cache");
        match self.lookup(key) {
          Ok(Some(cached)) => Ok(NetworkFirst::Cached(cached)),
          Ok(None) => Err(network_error),
          Err(e) => {
            warn!(%key, error = %e, "cache lookup failed");
            Err(network_error)
          }
        }
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      version: self.version.clone(),
    }
  }
}
