//! Background sync: replay queued mutations and refresh read-only data.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, CacheStorage, RequestKey};
use crate::queue::{MutationKind, MutationQueue, PendingMutation};
use crate::remote::{RemoteApi, Response, CONTENT_TYPE_JSON};

/// Tag of the periodic full refresh signal
pub const WEEKLY_REFRESH: &str = "weekly-refresh";

/// One-shot sync tags delivered when connectivity returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTag {
  Tasks,
  Notes,
}

impl SyncTag {
  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "sync-tasks" => Some(Self::Tasks),
      "sync-notes" => Some(Self::Notes),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Tasks => "sync-tasks",
      Self::Notes => "sync-notes",
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      Self::Tasks => MutationKind::Task,
      Self::Notes => MutationKind::Note,
    }
  }
}

/// Outcome of one replay pass over a kind
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
  pub kind: MutationKind,
  /// Accepted by the remote and removed from the queue
  pub synced: Vec<String>,
  /// Still queued for the next signal
  pub failed: Vec<String>,
}

/// Outcome of a periodic refresh
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
  pub refreshed: Vec<String>,
  pub failed: Vec<String>,
}

/// Tags the app asked to have synced on the next connectivity signal
#[derive(Default)]
pub struct SyncRegistry {
  tags: Mutex<BTreeSet<SyncTag>>,
}

impl SyncRegistry {
  pub fn register(&self, tag: SyncTag) -> Result<()> {
    self
      .tags
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(tag);
    Ok(())
  }

  /// Take every registered tag, leaving the registry empty
  pub fn drain(&self) -> Result<Vec<SyncTag>> {
    let mut tags = self.tags.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(std::mem::take(&mut *tags).into_iter().collect())
  }
}

pub struct SyncCoordinator<S: CacheStorage> {
  queue: Arc<dyn MutationQueue>,
  api: RemoteApi,
  cache: CacheLayer<S>,
  refresh_resources: Vec<String>,
  registry: SyncRegistry,
}

impl<S: CacheStorage> SyncCoordinator<S> {
  pub fn new(
    queue: Arc<dyn MutationQueue>,
    api: RemoteApi,
    cache: CacheLayer<S>,
    refresh_resources: Vec<String>,
  ) -> Self {
    Self {
      queue,
      api,
      cache,
      refresh_resources,
      registry: SyncRegistry::default(),
    }
  }

  pub fn registry(&self) -> &SyncRegistry {
    &self.registry
  }

  /// Handle a one-shot sync signal. Unknown tags are ignored.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    match SyncTag::parse(tag) {
      Some(tag) => self.sync_pending(tag.kind()).await.map(Some),
      None => {
        debug!(tag, "ignoring unknown sync tag");
        Ok(None)
      }
    }
  }

  /// Handle a periodic sync signal. Unknown tags are ignored.
  pub async fn on_periodic_sync(&self, tag: &str) -> Option<RefreshReport> {
    if tag == WEEKLY_REFRESH {
      Some(self.refresh().await)
    } else {
      debug!(tag, "ignoring unknown periodic sync tag");
      None
    }
  }

  /// Connectivity came back: run every registered sync.
  ///
  /// A tag whose pass could not run stays registered for the next signal;
  /// the other tags still run.
  pub async fn on_connectivity(&self) -> Result<Vec<SyncReport>> {
    let mut reports = Vec::new();
    for tag in self.registry.drain()? {
      match self.sync_pending(tag.kind()).await {
        Ok(report) => reports.push(report),
        Err(e) => {
          error!(tag = tag.as_str(), error = %e, "sync pass failed, keeping tag registered");
          self.registry.register(tag)?;
        }
      }
    }
    Ok(reports)
  }

  /// Replay every queued mutation of one kind, oldest first.
  ///
  /// Each record stands alone: a rejection or network error leaves it queued
  /// and moves on to the next one.
  pub async fn sync_pending(&self, kind: MutationKind) -> Result<SyncReport> {
    let pending = self.queue.list(kind)?;
    info!(kind = kind.as_str(), count = pending.len(), "syncing pending mutations");

    let mut report = SyncReport {
      kind,
      synced: Vec::new(),
      failed: Vec::new(),
    };

    for mutation in pending {
      if self.submit(&mutation).await {
        report.synced.push(mutation.id);
      } else {
        report.failed.push(mutation.id);
      }
    }

    info!(
      kind = kind.as_str(),
      synced = report.synced.len(),
      failed = report.failed.len(),
      "sync pass finished"
    );
    Ok(report)
  }

  /// Returns true once the remote accepted the record and it left the queue
  async fn submit(&self, mutation: &PendingMutation) -> bool {
    let response = match self.api.create(mutation.kind, &mutation.payload).await {
      Ok(response) => response,
      Err(e) => {
        warn!(id = %mutation.id, error = %e, "failed to sync mutation");
        return false;
      }
    };

    if !response.is_success() {
      warn!(id = %mutation.id, status = response.status, "remote rejected mutation");
      return false;
    }

    match self.queue.remove(&mutation.id) {
      Ok(_) => {
        info!(id = %mutation.id, kind = mutation.kind.as_str(), "mutation synced");
        true
      }
      Err(e) => {
        error!(id = %mutation.id, error = %e, "mutation accepted but could not be dequeued");
        false
      }
    }
  }

  /// Re-fetch the refresh resources in parallel and overwrite their cached
  /// copies. Each resource succeeds or fails on its own.
  pub async fn refresh(&self) -> RefreshReport {
    let results = join_all(
      self
        .refresh_resources
        .iter()
        .map(|path| async move { (path, self.refresh_one(path).await) }),
    )
    .await;

    let mut report = RefreshReport::default();
    for (path, result) in results {
      match result {
        Ok(()) => report.refreshed.push(path.clone()),
        Err(e) => {
          warn!(resource = %path, error = %e, "refresh failed");
          report.failed.push(path.clone());
        }
      }
    }

    info!(
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "periodic refresh finished"
    );
    report
  }

  async fn refresh_one(&self, path: &str) -> Result<()> {
    let (url, response) = self.api.get(path).await?;
    if !response.is_success() {
      return Err(eyre!("status {}", response.status));
    }

    let response = Response {
      status: 200,
      content_type: response
        .content_type
        .or_else(|| Some(CONTENT_TYPE_JSON.to_string())),
      body: response.body,
    };
    self.cache.store_dynamic(&RequestKey::from_url(&url), &response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, PartitionVersion};
  use crate::config::ApiConfig;
  use crate::queue::MemoryQueue;
  use crate::remote::mock::{origin, url, ScriptedNetwork};
  use crate::remote::{Network, Request};
  use reqwest::Method;
  use serde_json::{json, Value};

  struct Fixture {
    storage: Arc<MemoryStorage>,
    queue: Arc<MemoryQueue>,
    network: Arc<ScriptedNetwork>,
    coordinator: SyncCoordinator<MemoryStorage>,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let queue = Arc::new(MemoryQueue::new());
    let network = Arc::new(ScriptedNetwork::offline());
    let api = RemoteApi::new(network.clone() as Arc<dyn Network>, origin(), ApiConfig::default());
    let cache = CacheLayer::new(Arc::clone(&storage), PartitionVersion::new("taskpilot", "v2.0"));
    let coordinator = SyncCoordinator::new(
      queue.clone() as Arc<dyn MutationQueue>,
      api,
      cache,
      vec!["/api/weekly-tasks".to_string(), "/api/stats".to_string()],
    );
    Fixture {
      storage,
      queue,
      network,
      coordinator,
    }
  }

  fn body_id(req: &Request) -> Option<String> {
    let body: Value = serde_json::from_slice(req.body.as_ref()?).ok()?;
    body.get("id")?.as_str().map(String::from)
  }

  fn queued_ids(queue: &MemoryQueue, kind: MutationKind) -> Vec<String> {
    queue.list(kind).unwrap().into_iter().map(|m| m.id).collect()
  }

  #[tokio::test]
  async fn test_rejected_item_stays_others_synced_once() {
    let f = fixture();
    for id in ["A", "B", "C"] {
      f.queue
        .append(&PendingMutation::new(id, MutationKind::Task, json!({"id": id, "title": id})))
        .unwrap();
    }
    let tasks_url = url("/api/tasks").to_string();
    f.network.route(move |req| {
      if req.method != Method::POST || req.url.as_str() != tasks_url {
        return None;
      }
      match body_id(req).as_deref() {
        Some("B") => Some(Ok(Response::text(422, "rejected"))),
        _ => Some(Ok(Response::json(201, "{}"))),
      }
    });

    let report = f.coordinator.sync_pending(MutationKind::Task).await.unwrap();
    assert_eq!(report.synced, vec!["A", "C"]);
    assert_eq!(report.failed, vec!["B"]);
    assert_eq!(queued_ids(&f.queue, MutationKind::Task), vec!["B"]);

    let submitted: Vec<String> = f
      .network
      .calls_to(Method::POST, "/api/tasks")
      .iter()
      .filter_map(|c| {
        let body: Value = serde_json::from_slice(c.body.as_ref()?).ok()?;
        body["id"].as_str().map(String::from)
      })
      .collect();
    assert_eq!(submitted, vec!["A", "B", "C"]);
  }

  #[tokio::test]
  async fn test_network_error_does_not_abort_pass() {
    let f = fixture();
    for id in ["n1", "n2"] {
      f.queue
        .append(&PendingMutation::new(id, MutationKind::Note, json!({"id": id})))
        .unwrap();
    }
    let notes_url = url("/api/notes").to_string();
    f.network.route(move |req| {
      if req.url.as_str() != notes_url {
        return None;
      }
      match body_id(req).as_deref() {
        Some("n1") => Some(Err(crate::remote::NetworkError::Timeout)),
        _ => Some(Ok(Response::json(200, "{}"))),
      }
    });

    let report = f.coordinator.on_sync("sync-notes").await.unwrap().unwrap();
    assert_eq!(report.synced, vec!["n2"]);
    assert_eq!(queued_ids(&f.queue, MutationKind::Note), vec!["n1"]);
  }

  #[tokio::test]
  async fn test_sync_only_touches_requested_kind() {
    let f = fixture();
    f.queue.append(&PendingMutation::new("t", MutationKind::Task, json!({}))).unwrap();
    f.queue.append(&PendingMutation::new("n", MutationKind::Note, json!({}))).unwrap();
    f.network.respond(Method::POST, "/api/notes", Response::json(201, "{}"));

    f.coordinator.on_sync("sync-notes").await.unwrap();
    assert_eq!(queued_ids(&f.queue, MutationKind::Task), vec!["t"]);
    assert!(queued_ids(&f.queue, MutationKind::Note).is_empty());
    assert!(f.network.calls_to(Method::POST, "/api/tasks").is_empty());
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let f = fixture();
    assert!(f.coordinator.on_sync("sync-everything").await.unwrap().is_none());
    assert!(f.coordinator.on_periodic_sync("daily").await.is_none());
    assert!(f.network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_partial_failure_is_isolated() {
    let f = fixture();
    let stats_key = RequestKey::from_url(&url("/api/stats"));
    let weekly_key = RequestKey::from_url(&url("/api/weekly-tasks"));
    f.coordinator
      .cache
      .store_dynamic(&stats_key, &Response::json(200, r#"{"done":1}"#))
      .unwrap();

    f.network
      .respond(Method::GET, "/api/weekly-tasks", Response::json(200, r#"[{"id":"w1"}]"#));
    f.network.fail(Method::GET, "/api/stats");

    let report = f.coordinator.on_periodic_sync(WEEKLY_REFRESH).await.unwrap();
    assert_eq!(report.refreshed, vec!["/api/weekly-tasks"]);
    assert_eq!(report.failed, vec!["/api/stats"]);

    let dynamic = "taskpilot-dynamic-v2.0";
    let weekly = f.storage.get(dynamic, &weekly_key).unwrap().unwrap();
    assert_eq!(weekly.body, br#"[{"id":"w1"}]"#);
    let stats = f.storage.get(dynamic, &stats_key).unwrap().unwrap();
    assert_eq!(stats.body, br#"{"done":1}"#);
  }

  /// Queue whose first listing of tasks fails
  struct FlakyQueue {
    inner: MemoryQueue,
    fail_tasks: std::sync::atomic::AtomicBool,
  }

  impl MutationQueue for FlakyQueue {
    fn append(&self, mutation: &PendingMutation) -> Result<()> {
      self.inner.append(mutation)
    }

    fn list(&self, kind: MutationKind) -> Result<Vec<PendingMutation>> {
      if kind == MutationKind::Task && self.fail_tasks.swap(false, std::sync::atomic::Ordering::SeqCst) {
        return Err(eyre!("disk I/O error"));
      }
      self.inner.list(kind)
    }

    fn remove(&self, id: &str) -> Result<bool> {
      self.inner.remove(id)
    }
  }

  #[tokio::test]
  async fn test_connectivity_keeps_tag_whose_pass_failed() {
    let queue = Arc::new(FlakyQueue {
      inner: MemoryQueue::new(),
      fail_tasks: std::sync::atomic::AtomicBool::new(true),
    });
    queue.append(&PendingMutation::new("t1", MutationKind::Task, json!({}))).unwrap();
    queue.append(&PendingMutation::new("n1", MutationKind::Note, json!({}))).unwrap();

    let network = Arc::new(ScriptedNetwork::offline());
    network.respond(Method::POST, "/api/tasks", Response::json(201, "{}"));
    network.respond(Method::POST, "/api/notes", Response::json(201, "{}"));
    let api = RemoteApi::new(network.clone() as Arc<dyn Network>, origin(), ApiConfig::default());
    let cache = CacheLayer::new(
      Arc::new(MemoryStorage::new()),
      PartitionVersion::new("taskpilot", "v2.0"),
    );
    let coordinator = SyncCoordinator::new(queue.clone() as Arc<dyn MutationQueue>, api, cache, Vec::new());
    coordinator.registry().register(SyncTag::Tasks).unwrap();
    coordinator.registry().register(SyncTag::Notes).unwrap();

    let reports = coordinator.on_connectivity().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, MutationKind::Note);
    assert_eq!(reports[0].synced, vec!["n1"]);

    // Tasks were not lost: the next signal replays them
    let reports = coordinator.on_connectivity().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].synced, vec!["t1"]);
    assert!(queue.list(MutationKind::Task).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_connectivity_runs_registered_tags_once() {
    let f = fixture();
    f.queue.append(&PendingMutation::new("t", MutationKind::Task, json!({}))).unwrap();
    f.network.respond(Method::POST, "/api/tasks", Response::json(201, "{}"));

    f.coordinator.registry().register(SyncTag::Tasks).unwrap();
    f.coordinator.registry().register(SyncTag::Tasks).unwrap();

    let reports = f.coordinator.on_connectivity().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].synced, vec!["t"]);

    // Registry was drained
    assert!(f.coordinator.on_connectivity().await.unwrap().is_empty());
  }
}
