//! Install/activate lifecycle for one generation of cache partitions.
//!
//! ```text
//! Installing → Installed → Activating → Active
//!      └──────→ Redundant (install failed, previous generation stays)
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, PartitionVersion, RequestKey};
use crate::remote::{Network, NetworkError, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Installing => write!(f, "installing"),
      Self::Installed => write!(f, "installed"),
      Self::Activating => write!(f, "activating"),
      Self::Active => write!(f, "active"),
      Self::Redundant => write!(f, "redundant"),
    }
  }
}

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("invalid static asset url '{0}'")]
  InvalidUrl(String),
  #[error("failed to fetch static asset {url}: {source}")]
  Fetch { url: String, source: NetworkError },
  #[error("static asset {url} returned status {status}")]
  BadStatus { url: String, status: u16 },
  #[error("failed to store static assets: {0}")]
  Storage(String),
  #[error("cannot install while {0}")]
  InvalidState(LifecycleState),
  #[error("installed but immediate activation failed: {0}")]
  Activation(String),
}

pub struct LifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  origin: Url,
  version: PartitionVersion,
  static_assets: Vec<String>,
  state: watch::Sender<LifecycleState>,
  /// Generation whose partitions the cache layer reads and writes
  served: watch::Sender<PartitionVersion>,
  /// An older generation stays in control until this one activates
  serving_previous: AtomicBool,
  skip_waiting: AtomicBool,
  /// Serializes install/activate transitions
  transition: Mutex<()>,
}

impl<S: CacheStorage> LifecycleManager<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    origin: Url,
    version: PartitionVersion,
    static_assets: Vec<String>,
    activate_immediately: bool,
  ) -> Self {
    let (state, _) = watch::channel(LifecycleState::Installing);
    let (served, _) = watch::channel(version.clone());
    Self {
      storage,
      network,
      origin,
      version,
      static_assets,
      state,
      served,
      serving_previous: AtomicBool::new(false),
      skip_waiting: AtomicBool::new(activate_immediately),
      transition: Mutex::new(()),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  /// Watch state transitions; `Installed` is the "ready to activate" signal.
  #[allow(dead_code)]
  pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.state.subscribe()
  }

  /// Follow the generation currently being served
  pub fn served(&self) -> watch::Receiver<PartitionVersion> {
    self.served.subscribe()
  }

  /// Whether fetches should be routed through the interceptor
  pub fn is_controlling(&self) -> bool {
    self.state() == LifecycleState::Active || self.serving_previous.load(Ordering::SeqCst)
  }

  fn set_state(&self, state: LifecycleState) {
    debug!(version = self.version.tag(), %state, "lifecycle transition");
    self.state.send_replace(state);
  }

  /// Pick up where a previous process left off.
  ///
  /// If this generation's static partition exists and no other generation
  /// remains, it was installed and activated before: go straight to Active.
  /// Otherwise an older generation with a static partition keeps serving
  /// until this one activates (the highest tag wins if there are several).
  pub fn resume(&self) -> Result<LifecycleState> {
    let names = self.storage.list_partition_names()?;
    let installed = names.contains(&self.version.static_partition());
    let clean = names.iter().all(|n| self.version.is_current(n));

    if installed && clean {
      info!(version = self.version.tag(), "resuming active generation");
      self.set_state(LifecycleState::Active);
    } else if let Some(previous) = names
      .iter()
      .filter_map(|n| self.version.previous_from_static(n))
      .last()
    {
      info!(
        previous = previous.tag(),
        version = self.version.tag(),
        "previous generation stays in control until activation"
      );
      self.served.send_replace(previous);
      self.serving_previous.store(true, Ordering::SeqCst);
    }
    Ok(self.state())
  }

  /// Seed the static partition.
  ///
  /// Every asset is fetched before anything is written, and the batch is
  /// written in one transaction: a failure leaves no new static partition.
  pub async fn install(&self) -> Result<LifecycleState, InstallError> {
    {
      let _guard = self.transition.lock().await;
      match self.state() {
        LifecycleState::Activating | LifecycleState::Active => {
          return Err(InstallError::InvalidState(self.state()));
        }
        _ => self.set_state(LifecycleState::Installing),
      }

      info!(
        version = self.version.tag(),
        assets = self.static_assets.len(),
        "installing static assets"
      );

      match self.fetch_static_assets().await {
        Ok(entries) => {
          let partition = self.version.static_partition();
          if let Err(e) = self.storage.put_all(&partition, &entries) {
            error!(%partition, error = %e, "install failed");
            self.set_state(LifecycleState::Redundant);
            return Err(InstallError::Storage(e.to_string()));
          }
        }
        Err(e) => {
          error!(error = %e, "install failed");
          self.set_state(LifecycleState::Redundant);
          return Err(e);
        }
      }

      self.set_state(LifecycleState::Installed);
      info!(version = self.version.tag(), "installed, waiting to activate");
    }

    if self.skip_waiting.load(Ordering::SeqCst) {
      self
        .activate()
        .await
        .map_err(|e| InstallError::Activation(e.to_string()))?;
    }

    Ok(self.state())
  }

  async fn fetch_static_assets(&self) -> Result<Vec<(RequestKey, CacheEntry)>, InstallError> {
    let requests = self
      .static_assets
      .iter()
      .map(|asset| {
        self
          .origin
          .join(asset)
          .map(Request::get)
          .map_err(|_| InstallError::InvalidUrl(asset.clone()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let responses = join_all(requests.iter().map(|req| self.network.fetch(req))).await;

    requests
      .iter()
      .zip(responses)
      .map(|(req, response)| -> Result<(RequestKey, CacheEntry), InstallError> {
        let url = req.url.to_string();
        let response = response.map_err(|source| InstallError::Fetch {
          url: url.clone(),
          source,
        })?;
        if !response.is_success() {
          return Err(InstallError::BadStatus {
            url,
            status: response.status,
          });
        }
        Ok((RequestKey::from_url(&req.url), CacheEntry::from_response(&response)))
      })
      .collect()
  }

  /// Drop every partition that does not belong to the current generation,
  /// then take control. Returns the names of the deleted partitions.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let _guard = self.transition.lock().await;

    match self.state() {
      LifecycleState::Installed => {}
      LifecycleState::Active => return Ok(Vec::new()),
      other => return Err(eyre!("Cannot activate while {}", other)),
    }

    self.set_state(LifecycleState::Activating);
    info!(version = self.version.tag(), "activating");

    match self.prune_stale_partitions() {
      Ok(deleted) => {
        self.served.send_replace(self.version.clone());
        self.serving_previous.store(false, Ordering::SeqCst);
        self.set_state(LifecycleState::Active);
        info!(version = self.version.tag(), deleted = deleted.len(), "activated");
        Ok(deleted)
      }
      Err(e) => {
        // Stay installed so a later activation can retry
        self.set_state(LifecycleState::Installed);
        Err(e)
      }
    }
  }

  fn prune_stale_partitions(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.list_partition_names()? {
      if self.version.is_current(&name) {
        continue;
      }
      info!(partition = %name, "deleting stale partition");
      if self.storage.delete_partition(&name)? {
        deleted.push(name);
      }
    }
    self.storage.open(&self.version.dynamic_partition())?;
    Ok(deleted)
  }

  /// Force activation without waiting.
  ///
  /// If install has not finished yet, activation follows as soon as it does.
  pub async fn skip_waiting(&self) -> Result<LifecycleState> {
    self.skip_waiting.store(true, Ordering::SeqCst);
    if self.state() == LifecycleState::Installed {
      self.activate().await?;
    }
    Ok(self.state())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::remote::mock::{origin, ScriptedNetwork};
  use crate::remote::Response;
  use reqwest::Method;
  use std::collections::BTreeSet;

  fn manager(
    storage: &Arc<MemoryStorage>,
    network: &Arc<ScriptedNetwork>,
    immediate: bool,
  ) -> LifecycleManager<MemoryStorage> {
    LifecycleManager::new(
      Arc::clone(storage),
      network.clone() as Arc<dyn Network>,
      origin(),
      PartitionVersion::new("taskpilot", "v2"),
      vec!["/".to_string(), "/index.html".to_string(), "/app.css".to_string()],
      immediate,
    )
  }

  fn serve_assets(network: &ScriptedNetwork) {
    network.respond(Method::GET, "/", Response::new(200, Some("text/html"), "<root>"));
    network.respond(Method::GET, "/index.html", Response::new(200, Some("text/html"), "<index>"));
    network.respond(Method::GET, "/app.css", Response::new(200, Some("text/css"), "body{}"));
  }

  fn names(storage: &MemoryStorage) -> BTreeSet<String> {
    storage.list_partition_names().unwrap()
  }

  #[tokio::test]
  async fn test_install_seeds_static_and_waits() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, false);
    let mut rx = lm.subscribe();

    assert_eq!(lm.install().await.unwrap(), LifecycleState::Installed);
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), LifecycleState::Installed);
    assert!(!lm.is_controlling());

    let key = RequestKey::resolve(&origin(), "/index.html").unwrap();
    let entry = storage.get("taskpilot-static-v2", &key).unwrap().unwrap();
    assert_eq!(entry.body, b"<index>");
  }

  #[tokio::test]
  async fn test_install_failure_is_atomic() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());
    network.respond(Method::GET, "/", Response::text(200, "<root>"));
    network.respond(Method::GET, "/index.html", Response::text(200, "<index>"));
    // /app.css is unrouted, so it fails like an offline fetch

    let lm = manager(&storage, &network, true);
    let err = lm.install().await.unwrap_err();
    assert!(matches!(err, InstallError::Fetch { .. }));
    assert_eq!(lm.state(), LifecycleState::Redundant);
    assert!(names(&storage).is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());
    network.respond(Method::GET, "/", Response::text(200, "<root>"));
    network.respond(Method::GET, "/index.html", Response::text(404, "missing"));
    network.respond(Method::GET, "/app.css", Response::text(200, "body{}"));

    let lm = manager(&storage, &network, false);
    let err = lm.install().await.unwrap_err();
    assert!(matches!(err, InstallError::BadStatus { status: 404, .. }));
    assert!(names(&storage).is_empty());
  }

  #[tokio::test]
  async fn test_activate_prunes_stale_generations() {
    let storage = Arc::new(MemoryStorage::new());
    for name in [
      "taskpilot-static-v1",
      "taskpilot-dynamic-v1",
      "taskpilot-static-v2",
      "taskpilot-dynamic-v2",
    ] {
      storage.open(name).unwrap();
    }
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, false);

    lm.install().await.unwrap();
    let mut deleted = lm.activate().await.unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["taskpilot-dynamic-v1", "taskpilot-static-v1"]);
    assert_eq!(
      names(&storage).into_iter().collect::<Vec<_>>(),
      vec!["taskpilot-dynamic-v2", "taskpilot-static-v2"]
    );
    assert!(lm.is_controlling());
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("taskpilot-static-v1").unwrap();
    let network = Arc::new(ScriptedNetwork::offline());
    let lm = manager(&storage, &network, false);

    assert!(lm.activate().await.is_err());
    assert!(names(&storage).contains("taskpilot-static-v1"));
  }

  #[tokio::test]
  async fn test_activate_immediately_override() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("taskpilot-static-v1").unwrap();
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, true);

    assert_eq!(lm.install().await.unwrap(), LifecycleState::Active);
    assert!(!names(&storage).contains("taskpilot-static-v1"));
  }

  #[tokio::test]
  async fn test_skip_waiting_after_install() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, false);

    lm.install().await.unwrap();
    assert_eq!(lm.skip_waiting().await.unwrap(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_applies_later() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, false);

    assert_eq!(lm.skip_waiting().await.unwrap(), LifecycleState::Installing);
    assert_eq!(lm.install().await.unwrap(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_previous_generation_serving() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("taskpilot-static-v1").unwrap();
    storage.open("taskpilot-dynamic-v1").unwrap();
    let network = Arc::new(ScriptedNetwork::offline());
    let lm = manager(&storage, &network, false);

    assert_eq!(lm.resume().unwrap(), LifecycleState::Installing);
    assert!(lm.is_controlling());
    let served = lm.served();
    assert_eq!(served.borrow().static_partition(), "taskpilot-static-v1");

    // Offline: every asset fetch fails
    assert!(lm.install().await.is_err());
    assert_eq!(lm.state(), LifecycleState::Redundant);
    assert!(lm.is_controlling());
    assert_eq!(served.borrow().static_partition(), "taskpilot-static-v1");
    assert!(names(&storage).contains("taskpilot-static-v1"));
  }

  #[tokio::test]
  async fn test_activation_switches_served_generation() {
    let storage = Arc::new(MemoryStorage::new());
    storage.open("taskpilot-static-v1").unwrap();
    let network = Arc::new(ScriptedNetwork::offline());
    serve_assets(&network);
    let lm = manager(&storage, &network, false);
    lm.resume().unwrap();
    let served = lm.served();

    lm.install().await.unwrap();
    assert_eq!(served.borrow().static_partition(), "taskpilot-static-v1");

    lm.activate().await.unwrap();
    assert_eq!(served.borrow().static_partition(), "taskpilot-static-v2");
    assert!(!names(&storage).contains("taskpilot-static-v1"));
  }

  #[tokio::test]
  async fn test_resume_only_when_clean() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::offline());

    storage.open("taskpilot-static-v2").unwrap();
    storage.open("taskpilot-static-v1").unwrap();
    let lm = manager(&storage, &network, false);
    assert_eq!(lm.resume().unwrap(), LifecycleState::Installing);

    storage.delete_partition("taskpilot-static-v1").unwrap();
    let lm = manager(&storage, &network, false);
    assert_eq!(lm.resume().unwrap(), LifecycleState::Active);
  }
}
