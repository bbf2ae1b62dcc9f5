//! Record types queued for delivery.

use crate::{Attributes, IdentitySnapshot, PushPayload, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// Delivery class of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Sent with the next regular batch
    #[default]
    Normal,
    /// Sent right away, ahead of normal records and regardless of backoff
    Immediate,
}

/// Push service a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushService {
    Apns,
    Firebase,
    Custom,
}

/// Token that identifies this device to a push service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum PushToken {
    /// APNs device token (hex string)
    Apns { token: String },
    /// Firebase registration token
    Firebase { token: String },
    /// Any other push service, described by free-form key/values
    Custom {
        token: String,
        #[serde(rename = "serviceDesc", default)]
        service_desc: Attributes,
    },
}

impl PushToken {
    /// Build a token from the façade's `(kind, token, extra)` triple.
    pub fn from_parts(
        service: PushService,
        token: impl Into<String>,
        extra: Option<Attributes>,
    ) -> Self {
        let token = token.into();
        match service {
            PushService::Apns => PushToken::Apns { token },
            PushService::Firebase => PushToken::Firebase { token },
            PushService::Custom => PushToken::Custom {
                token,
                service_desc: extra.unwrap_or_default(),
            },
        }
    }

    /// The raw token string.
    pub fn token(&self) -> &str {
        match self {
            PushToken::Apns { token }
            | PushToken::Firebase { token }
            | PushToken::Custom { token, .. } => token,
        }
    }

    /// The service this token is for.
    pub fn service(&self) -> PushService {
        match self {
            PushToken::Apns { .. } => PushService::Apns,
            PushToken::Firebase { .. } => PushService::Firebase,
            PushToken::Custom { .. } => PushService::Custom,
        }
    }
}

/// What a record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordBody {
    /// A named analytics event
    Event { name: String, attributes: Attributes },
    /// An update of the user's attributes
    UserAttributes { attributes: Attributes },
    /// A new push token, or `None` when the token was cleared
    PushTokenUpdate { token: Option<PushToken> },
    /// A push notification was received
    PushReceipt { payload: PushPayload },
}

impl RecordBody {
    /// Priority implied by the kind of record.
    ///
    /// User info and push receipts upload immediately.
    pub fn priority(&self) -> Priority {
        match self {
            RecordBody::UserAttributes { .. } | RecordBody::PushReceipt { .. } => {
                Priority::Immediate
            }
            RecordBody::Event { .. } | RecordBody::PushTokenUpdate { .. } => Priority::Normal,
        }
    }

    /// Short name of the record kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordBody::Event { .. } => "event",
            RecordBody::UserAttributes { .. } => "userAttributes",
            RecordBody::PushTokenUpdate { .. } => "pushTokenUpdate",
            RecordBody::PushReceipt { .. } => "pushReceipt",
        }
    }
}

/// One unit of telemetry or identity-state change queued for delivery.
///
/// Records are immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Position in the device's record stream
    pub sequence: Sequence,
    /// When the record was created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Delivery class
    pub priority: Priority,
    /// Identity at the time the record was created
    pub identity: IdentitySnapshot,
    /// The record content
    pub body: RecordBody,
}

impl Record {
    /// Create a new record. The priority follows the body.
    pub fn new(
        sequence: Sequence,
        created_at: Timestamp,
        identity: IdentitySnapshot,
        body: RecordBody,
    ) -> Self {
        Self {
            sequence,
            created_at,
            priority: body.priority(),
            identity,
            body,
        }
    }

    /// Check if the record bypasses batching delay.
    pub fn is_immediate(&self) -> bool {
        self.priority == Priority::Immediate
    }

    /// Size of the record on the wire, in bytes.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}
