//! Control messages posted by the web app.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheLayer, CacheStorage, RequestKey};
use crate::remote::Response;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
  /// Activate the installed generation now
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
  /// Keep this task list available offline
  #[serde(rename = "CACHE_TASKS")]
  CacheTasks {
    #[serde(default)]
    tasks: Vec<Value>,
  },
  /// Sync queued tasks on the next connectivity signal
  #[serde(rename = "REGISTER_SYNC")]
  RegisterSync,
}

impl HostMessage {
  /// Decode a message; anything unrecognized is dropped.
  pub fn parse(data: &Value) -> Option<Self> {
    match serde_json::from_value(data.clone()) {
      Ok(message) => Some(message),
      Err(e) => {
        debug!(error = %e, "ignoring unrecognized message");
        None
      }
    }
  }
}

/// Store the task list verbatim, in order, as the cached task endpoint.
pub fn cache_task_list<S: CacheStorage>(
  cache: &CacheLayer<S>,
  key: &RequestKey,
  tasks: &[Value],
) -> Result<()> {
  let body = serde_json::to_vec(tasks).map_err(|e| eyre!("Failed to encode task list: {}", e))?;
  cache.store_dynamic(key, &Response::json(200, body))?;
  info!(count = tasks.len(), "tasks cached for offline access");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, PartitionVersion};
  use serde_json::json;
  use std::sync::Arc;
  use url::Url;

  #[test]
  fn test_parse_known_messages() {
    assert_eq!(
      HostMessage::parse(&json!({"type": "SKIP_WAITING"})),
      Some(HostMessage::SkipWaiting)
    );
    assert_eq!(
      HostMessage::parse(&json!({"type": "REGISTER_SYNC"})),
      Some(HostMessage::RegisterSync)
    );
    assert_eq!(
      HostMessage::parse(&json!({"type": "CACHE_TASKS", "tasks": [{"id": 1}]})),
      Some(HostMessage::CacheTasks {
        tasks: vec![json!({"id": 1})]
      })
    );
  }

  #[test]
  fn test_parse_unknown_or_malformed() {
    assert_eq!(HostMessage::parse(&json!({"type": "RELOAD"})), None);
    assert_eq!(HostMessage::parse(&json!({"kind": "SKIP_WAITING"})), None);
    assert_eq!(HostMessage::parse(&json!(null)), None);
  }

  #[test]
  fn test_cache_task_list_stores_verbatim_in_order() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = CacheLayer::new(Arc::clone(&storage), PartitionVersion::new("taskpilot", "v2.0"));
    let key = RequestKey::resolve(&Url::parse("http://localhost:8080").unwrap(), "/api/tasks").unwrap();
    let tasks = vec![json!({"id": "b", "done": false}), json!({"id": "a", "done": true})];

    cache_task_list(&cache, &key, &tasks).unwrap();

    let entry = storage.get("taskpilot-dynamic-v2.0", &key).unwrap().unwrap();
    let stored: Vec<Value> = serde_json::from_slice(&entry.body).unwrap();
    assert_eq!(stored, tasks);
    assert_eq!(entry.content_type.as_deref(), Some("application/json"));
  }
}
