//! Push payload handling and click-target validation.
//!
//! Push payloads arrive over the network and are attacker-controllable.
//! The target path carried by a notification is therefore validated against
//! a strict same-origin whitelist before it is ever used for navigation;
//! anything suspicious degrades to `/`.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Fallback body length when a payload doesn't parse as JSON.
const MAX_FALLBACK_BODY: usize = 240;

/// Structured push payload as sent by the push service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub target_path: Option<String>,
  pub tag: Option<String>,
  pub data: Value,
}

/// A notification as handed to the OS display layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedNotification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub tag: Option<String>,
  pub target_path: String,
  pub data: Value,
}

/// Host-side effects the dispatcher triggers: OS notification display and
/// page navigation. Implemented by the embedding application.
pub trait HostSink: Send + Sync {
  fn display(&self, notification: &DisplayedNotification);
  fn navigate(&self, path: &str);
}

/// Sink that only logs, used when no host is attached.
pub struct LogSink;

impl HostSink for LogSink {
  fn display(&self, notification: &DisplayedNotification) {
    tracing::info!(title = %notification.title, "notification displayed");
  }

  fn navigate(&self, path: &str) {
    tracing::info!(path, "navigation requested");
  }
}

/// Turns raw push payloads into displayable notifications and click events
/// into validated navigation targets.
pub struct NotificationDispatcher {
  default_title: String,
}

impl NotificationDispatcher {
  pub fn new(default_title: impl Into<String>) -> Self {
    Self {
      default_title: default_title.into(),
    }
  }

  /// Parse a raw push payload. A payload that isn't valid JSON degrades to
  /// a default notification whose body is the raw text, treated strictly
  /// as text.
  pub fn on_push(&self, raw: &[u8]) -> DisplayedNotification {
    match serde_json::from_slice::<NotificationPayload>(raw) {
      Ok(payload) => DisplayedNotification {
        title: payload
          .title
          .filter(|t| !t.is_empty())
          .unwrap_or_else(|| self.default_title.clone()),
        body: payload.body.unwrap_or_default(),
        icon: payload.icon,
        tag: payload.tag,
        target_path: payload.target_path.unwrap_or_else(|| "/".to_string()),
        data: payload.data,
      },
      Err(e) => {
        warn!(error = %e, "malformed push payload, using fallback notification");
        let mut body = String::from_utf8_lossy(raw).into_owned();
        if body.len() > MAX_FALLBACK_BODY {
          let mut end = MAX_FALLBACK_BODY;
          while !body.is_char_boundary(end) {
            end -= 1;
          }
          body.truncate(end);
        }

        DisplayedNotification {
          title: self.default_title.clone(),
          body,
          icon: None,
          tag: None,
          target_path: "/".to_string(),
          data: Value::Null,
        }
      }
    }
  }

  /// Resolve the navigation target for a clicked notification. Always
  /// returns a safe relative path.
  pub fn on_click(&self, notification: &DisplayedNotification) -> String {
    if is_valid_relative_path(&notification.target_path) {
      notification.target_path.clone()
    } else {
      warn!(
        target = %notification.target_path,
        "rejected notification navigation target"
      );
      "/".to_string()
    }
  }
}

/// Whitelist check for notification click targets: the path must be
/// same-origin relative. It has to start with `/`, must not be
/// protocol-relative (`//`), and must not carry a `scheme:` prefix, checked
/// again after one round of percent-decoding.
pub fn is_valid_relative_path(path: &str) -> bool {
  fn acceptable(p: &str) -> bool {
    p.starts_with('/') && !p.starts_with("//") && !has_scheme_prefix(p)
  }

  if !acceptable(path) {
    return false;
  }

  let decoded = percent_decode_str(path).decode_utf8_lossy();
  acceptable(&decoded)
}

/// RFC 3986 scheme: an ASCII letter followed by letters, digits, `+`, `-`
/// or `.`, terminated by `:`.
fn has_scheme_prefix(p: &str) -> bool {
  let mut chars = p.chars();

  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() => {}
    _ => return false,
  }

  for c in chars {
    match c {
      ':' => return true,
      c if c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.' => {}
      _ => return false,
    }
  }

  false
}
