//! Push payload parsing and notification-extension helpers.
//!
//! A push arrives as a loosely typed map (`userInfo` on iOS). It is parsed
//! once into a [`PushPayload`] at the edge; anything that does not fit the
//! expected shape is rejected with [`Error::MalformedPayload`] instead of
//! travelling further down the pipeline.
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "aps": {
//!     "alert": {"title": "Hi", "subtitle": "There", "body": "Open me"},
//!     "badge": 3,
//!     "sound": "default",
//!     "category": "promo",
//!     "thread-id": "news",
//!     "mutable-content": 1
//!   },
//!   "approver": {"pushId": "p-123", "mediaUrl": "https://cdn.example.com/a.png"},
//!   "anything": "else is kept as custom data"
//! }
//! ```

use crate::{error::Result, Error, RecordBody};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Alert text of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A validated push payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Approver's identifier of the push campaign message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_id: Option<String>,
    #[serde(default)]
    pub alert: Alert,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub mutable_content: bool,
    #[serde(default)]
    pub content_available: bool,
    /// Rich media to attach in the service extension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Top-level keys other than `aps` and `approver`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedPayload(reason.into())
}

fn opt_string(map: &Map<String, Value>, key: &str, path: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(malformed(format!("'{path}' must be a string"))),
    }
}

fn flag(map: &Map<String, Value>, key: &str) -> Result<bool> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(v) => match v.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(malformed(format!("'aps.{key}' must be 0 or 1"))),
        },
    }
}

fn parse_alert(aps: &Map<String, Value>) -> Result<Alert> {
    match aps.get("alert") {
        None | Some(Value::Null) => Ok(Alert::default()),
        Some(Value::String(body)) => Ok(Alert {
            body: Some(body.clone()),
            ..Alert::default()
        }),
        Some(Value::Object(alert)) => Ok(Alert {
            title: opt_string(alert, "title", "aps.alert.title")?,
            subtitle: opt_string(alert, "subtitle", "aps.alert.subtitle")?,
            body: opt_string(alert, "body", "aps.alert.body")?,
        }),
        Some(_) => Err(malformed("'aps.alert' must be a string or an object")),
    }
}

fn parse_sound(aps: &Map<String, Value>) -> Result<Option<String>> {
    match aps.get("sound") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(name.clone())),
        // Critical alert sounds come as a dictionary
        Some(Value::Object(sound)) => opt_string(sound, "name", "aps.sound.name"),
        Some(_) => Err(malformed("'aps.sound' must be a string or an object")),
    }
}

impl PushPayload {
    /// Parse a push payload from its loosely typed form.
    pub fn parse(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| malformed("payload must be an object"))?;
        let aps = root
            .get("aps")
            .ok_or_else(|| malformed("missing 'aps'"))?
            .as_object()
            .ok_or_else(|| malformed("'aps' must be an object"))?;

        let badge = match aps.get("badge") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| malformed("'aps.badge' must be a non-negative integer"))?,
            ),
        };

        let (push_id, media_url) = match root.get("approver") {
            None | Some(Value::Null) => (None, None),
            Some(Value::Object(approver)) => (
                opt_string(approver, "pushId", "approver.pushId")?,
                opt_string(approver, "mediaUrl", "approver.mediaUrl")?,
            ),
            Some(_) => return Err(malformed("'approver' must be an object")),
        };

        let custom = root
            .iter()
            .filter(|(key, _)| key.as_str() != "aps" && key.as_str() != "approver")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            push_id,
            alert: parse_alert(aps)?,
            badge,
            sound: parse_sound(aps)?,
            category: opt_string(aps, "category", "aps.category")?,
            thread_id: opt_string(aps, "thread-id", "aps.thread-id")?,
            mutable_content: flag(aps, "mutable-content")?,
            content_available: flag(aps, "content-available")?,
            media_url,
            custom,
        })
    }
}

/// Content of a notification as the notification service extension sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationContent {
    pub title: String,
    pub subtitle: String,
    pub body: String,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category_identifier: String,
    pub thread_identifier: String,
    /// Attachment URLs
    pub attachments: Vec<String>,
    /// The raw push payload
    pub user_info: Value,
}

/// A notification request handed to the service extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationRequest {
    pub identifier: String,
    pub content: NotificationContent,
}

/// Parse the push carried by an extension request into a receipt body.
///
/// When the payload has no `approver.pushId`, the request identifier is
/// used so the receipt can still be matched.
pub fn extract_push_payload(request: &NotificationRequest) -> Result<RecordBody> {
    let mut payload = PushPayload::parse(&request.content.user_info)?;
    if payload.push_id.is_none() && !request.identifier.is_empty() {
        payload.push_id = Some(request.identifier.clone());
    }
    Ok(RecordBody::PushReceipt { payload })
}

fn fill(target: &mut String, source: &Option<String>) {
    if target.is_empty() {
        if let Some(value) = source {
            target.clone_from(value);
        }
    }
}

/// Produce the best-attempt content for a notification.
///
/// Fields already set on `original` win; missing ones are taken from the
/// payload, and the payload's media URL is attached once. A malformed
/// payload leaves the content untouched.
pub fn apply_best_attempt_content(original: &NotificationContent) -> NotificationContent {
    let mut content = original.clone();
    let payload = match PushPayload::parse(&original.user_info) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(error = %err, "keeping original notification content");
            return content;
        }
    };

    fill(&mut content.title, &payload.alert.title);
    fill(&mut content.subtitle, &payload.alert.subtitle);
    fill(&mut content.body, &payload.alert.body);
    fill(&mut content.category_identifier, &payload.category);
    fill(&mut content.thread_identifier, &payload.thread_id);
    if content.badge.is_none() {
        content.badge = payload.badge;
    }
    if content.sound.is_none() {
        content.sound = payload.sound;
    }
    if let Some(url) = payload.media_url {
        if !content.attachments.contains(&url) {
            content.attachments.push(url);
        }
    }

    content
}
