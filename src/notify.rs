//! Push notification shaping and click routing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

use crate::config::NotificationDefaults;

pub const VIBRATE_PATTERN: [u32; 3] = [100, 50, 100];
pub const ACTION_OPEN: &str = "open";
pub const ACTION_DISMISS: &str = "dismiss";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Description of a notification for the host to display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Where "open" leads
  pub url: String,
  pub actions: Vec<NotificationAction>,
}

/// Merge a push payload over the configured defaults.
///
/// A payload that is not a JSON object is logged and the defaults are used.
pub fn build_notification(defaults: &NotificationDefaults, payload: Option<&str>) -> Notification {
  let overrides = payload.map(parse_payload).unwrap_or_default();
  let pick = |field: &str, default: &str| -> String {
    overrides
      .get(field)
      .and_then(Value::as_str)
      .unwrap_or(default)
      .to_string()
  };

  Notification {
    title: pick("title", defaults.title.as_str()),
    body: pick("body", defaults.body.as_str()),
    icon: pick("icon", defaults.icon.as_str()),
    badge: pick("badge", defaults.badge.as_str()),
    vibrate: VIBRATE_PATTERN.to_vec(),
    url: pick("url", defaults.url.as_str()),
    actions: vec![
      NotificationAction {
        action: ACTION_OPEN.to_string(),
        title: "Open App".to_string(),
      },
      NotificationAction {
        action: ACTION_DISMISS.to_string(),
        title: "Dismiss".to_string(),
      },
    ],
  }
}

fn parse_payload(raw: &str) -> Map<String, Value> {
  match serde_json::from_str::<Value>(raw) {
    Ok(Value::Object(map)) => map,
    Ok(other) => {
      warn!(payload = %other, "push payload is not an object, using defaults");
      Map::new()
    }
    Err(e) => {
      warn!(error = %e, "malformed push payload, using defaults");
      Map::new()
    }
  }
}

/// An open window of the app, as reported by the host
#[derive(Debug, Clone, Deserialize)]
pub struct ClientWindow {
  pub id: String,
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClickOutcome {
  Dismissed,
  Focus { client_id: String },
  OpenWindow { url: String },
}

/// Decide what a notification click does.
///
/// "dismiss" does nothing. Any other action (including a click on the body)
/// focuses the first window on the app origin, or opens a new one.
pub fn handle_click(
  action: Option<&str>,
  target: &str,
  clients: &[ClientWindow],
  origin: &Url,
) -> ClickOutcome {
  if action == Some(ACTION_DISMISS) {
    return ClickOutcome::Dismissed;
  }

  let same_origin = |client: &&ClientWindow| {
    Url::parse(&client.url)
      .map(|u| u.origin() == origin.origin())
      .unwrap_or(false)
  };

  if let Some(client) = clients.iter().find(same_origin) {
    return ClickOutcome::Focus {
      client_id: client.id.clone(),
    };
  }

  let url = origin
    .join(target)
    .map(String::from)
    .unwrap_or_else(|_| origin.to_string());
  ClickOutcome::OpenWindow { url }
}
