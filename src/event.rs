use base64::prelude::*;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::CacheSource;
use crate::lifecycle::LifecycleState;
use crate::notify::{ClickOutcome, ClientWindow, Notification};
use crate::queue::MutationKind;
use crate::remote::Response;
use crate::sync::{RefreshReport, SyncReport};

/// A request as described by the host
#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
  #[serde(default = "default_method")]
  pub method: String,
  /// Absolute URL or path relative to the app origin
  pub url: String,
  /// Top-level navigation
  #[serde(default)]
  pub navigate: bool,
  #[serde(default)]
  pub content_type: Option<String>,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub body_encoding: BodyEncoding,
}

impl FetchRequest {
  /// Request body as raw bytes
  pub fn body_bytes(&self) -> Result<Option<Vec<u8>>> {
    self
      .body
      .as_deref()
      .map(|body| decode_body(body, self.body_encoding))
      .transpose()
  }
}

fn default_method() -> String {
  "GET".to_string()
}

/// How a body travels inside a JSON line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  #[default]
  Utf8,
  Base64,
}

/// Text bodies stay readable; anything that is not valid UTF-8 goes as base64.
pub fn encode_body(bytes: &[u8]) -> (String, BodyEncoding) {
  match std::str::from_utf8(bytes) {
    Ok(text) => (text.to_string(), BodyEncoding::Utf8),
    Err(_) => (BASE64_STANDARD.encode(bytes), BodyEncoding::Base64),
  }
}

pub fn decode_body(body: &str, encoding: BodyEncoding) -> Result<Vec<u8>> {
  match encoding {
    BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
    BodyEncoding::Base64 => BASE64_STANDARD
      .decode(body)
      .map_err(|e| eyre!("Failed to decode base64 body: {}", e)),
  }
}

/// Host events
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  Install,
  Activate,
  Fetch {
    request: FetchRequest,
  },
  /// One-shot background sync for a tag
  Sync {
    tag: String,
  },
  PeriodicSync {
    tag: String,
  },
  /// Connectivity regained: run every registered sync
  Online,
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    clients: Vec<ClientWindow>,
  },
  Message {
    data: Value,
  },
  /// The app could not reach the network for a mutation; keep it for replay
  Enqueue {
    mutation: NewMutation,
  },
}

/// A mutation the app wants replayed later
#[derive(Debug, Clone, Deserialize)]
pub struct NewMutation {
  pub id: String,
  pub kind: MutationKind,
  pub payload: Value,
}

/// A host event plus an optional correlation id echoed in the reply
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(flatten)]
  pub event: HostEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ReplyBody {
  Lifecycle {
    state: LifecycleState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    deleted: Vec<String>,
  },
  Response {
    status: u16,
    content_type: Option<String>,
    body: String,
    body_encoding: BodyEncoding,
    /// None when the request bypassed interception
    source: Option<CacheSource>,
    /// When a cached copy was stored
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_at: Option<DateTime<Utc>>,
  },
  Sync {
    reports: Vec<SyncReport>,
  },
  Refresh {
    report: Option<RefreshReport>,
  },
  Notification {
    notification: Notification,
  },
  Click {
    #[serde(flatten)]
    outcome: ClickOutcome,
  },
  Ack,
  Error {
    message: String,
  },
}

impl ReplyBody {
  pub fn response(
    response: Response,
    source: Option<CacheSource>,
    cached_at: Option<DateTime<Utc>>,
  ) -> Self {
    let (body, body_encoding) = encode_body(&response.body);
    Self::Response {
      status: response.status,
      content_type: response.content_type,
      body,
      body_encoding,
      source,
      cached_at,
    }
  }

  pub fn error(message: impl std::fmt::Display) -> Self {
    Self::Error {
      message: message.to_string(),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(flatten)]
  pub body: ReplyBody,
}

/// Event handler that produces host events from newline-delimited JSON on stdin
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Envelope>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
              Ok(envelope) => {
                if tx.send(envelope).is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "ignoring malformed host event"),
            }
          }
          Ok(None) => {
            debug!("host closed event stream");
            break;
          }
          Err(e) => {
            warn!(error = %e, "failed to read host event");
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Envelope> {
    self.rx.recv().await
  }
}
