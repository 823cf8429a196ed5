//! Fetch interception: network first, cached copy when offline, and a
//! deterministic placeholder when there is nothing to serve.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, NetworkFirst, RequestKey};
use crate::config::CacheConfig;
use crate::remote::{Network, NetworkError, Request, Response};

pub const PLACEHOLDER_STATUS: u16 = 408;
pub const PLACEHOLDER_BODY: &str = "Network error occurred";

/// What the interceptor decided for one request
#[derive(Debug)]
pub enum Interception {
  /// Not ours: let the request go to the network untouched
  Bypass,
  /// Answered by the interceptor
  Respond(Intercepted),
}

#[derive(Debug)]
pub struct Intercepted {
  pub result: CacheResult<Response>,
  /// Background write of a fresh response into the dynamic partition
  pub persist: Option<JoinHandle<()>>,
}

impl Intercepted {
  fn new(result: CacheResult<Response>) -> Self {
    Self {
      result,
      persist: None,
    }
  }
}

pub struct FetchInterceptor<S: CacheStorage> {
  cache: CacheLayer<S>,
  network: Arc<dyn Network>,
  origin: Url,
  config: CacheConfig,
}

impl<S: CacheStorage> FetchInterceptor<S> {
  pub fn new(cache: CacheLayer<S>, network: Arc<dyn Network>, origin: Url, config: CacheConfig) -> Self {
    Self {
      cache,
      network,
      origin,
      config,
    }
  }

  pub fn is_health_check(&self, request: &Request) -> bool {
    request.url.path().ends_with(&self.config.health_path)
  }

  /// Only GETs on non-excluded schemes go through the cache
  pub fn should_intercept(&self, request: &Request) -> bool {
    request.method == reqwest::Method::GET
      && !self
        .config
        .excluded_schemes
        .iter()
        .any(|scheme| request.url.scheme().eq_ignore_ascii_case(scheme))
  }

  pub async fn handle(&self, request: &Request) -> Interception {
    if self.is_health_check(request) {
      return Interception::Respond(Intercepted::new(CacheResult::synthesized(
        Response::text(200, "OK"),
        CacheSource::HealthCheck,
      )));
    }

    if !self.should_intercept(request) {
      debug!(method = %request.method, url = %request.url, "bypassing interception");
      return Interception::Bypass;
    }

    let key = RequestKey::from_url(&request.url);
    let network = Arc::clone(&self.network);
    let outcome = self
      .cache
      .fetch_network_first(&key, || async move { network.fetch(request).await })
      .await;

    let intercepted = match outcome {
      Ok(NetworkFirst::Network { response, persist }) => Intercepted {
        result: CacheResult::from_network(response),
        persist,
      },
      Ok(NetworkFirst::Cached(cached)) => {
        debug!(%key, source = ?cached.source, "served from cache");
        Intercepted::new(cached)
      }
      Err(error) => Intercepted::new(self.offline_fallback(request, &key, &error)),
    };

    Interception::Respond(intercepted)
  }

  /// Network failed and the request itself is not cached.
  fn offline_fallback(
    &self,
    request: &Request,
    key: &RequestKey,
    error: &NetworkError,
  ) -> CacheResult<Response> {
    if request.navigation {
      if let Some(mut page) = self.offline_page() {
        debug!(%key, "serving offline page for navigation");
        page.source = CacheSource::OfflinePage;
        return page;
      }
    }

    warn!(%key, %error, "network failed and nothing cached");
    CacheResult::synthesized(placeholder(), CacheSource::Placeholder)
  }

  /// The configured offline document, else the cached root document
  fn offline_page(&self) -> Option<CacheResult<Response>> {
    [self.config.offline_page.as_str(), "/"]
      .into_iter()
      .filter_map(|path| RequestKey::resolve(&self.origin, path).ok())
      .find_map(|key| match self.cache.lookup(&key) {
        Ok(found) => found,
        Err(e) => {
          warn!(%key, error = %e, "offline page lookup failed");
          None
        }
      })
  }
}

/// Deterministic response for uncached requests while offline
pub fn placeholder() -> Response {
  Response::text(PLACEHOLDER_STATUS, PLACEHOLDER_BODY)
}
