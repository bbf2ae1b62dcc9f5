//! Wire protocol and transport to the collection endpoint.
//!
//! A batch goes out as one JSON `POST`:
//!
//! ```json
//! {
//!   "deviceId": "5f1c...",
//!   "identity": {"appId": "app-1", "deviceId": "5f1c..."},
//!   "sentAt": 1706745600000,
//!   "records": [{"sequence": 11, "createdAt": ..., "priority": "immediate", ...}]
//! }
//! ```
//!
//! The endpoint answers with the highest sequence it has stored:
//! `{"ackedThrough": 11}`. Anything other than a 2xx response with that
//! body is a failed attempt.

use crate::{Batch, DeviceId, Error, IdentitySnapshot, Record, Sequence, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Device the records come from
    pub device_id: DeviceId,
    /// Identity at send time; absent while the engine is not initialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentitySnapshot>,
    /// When the request was built (milliseconds since epoch)
    pub sent_at: Timestamp,
    /// Records in send order
    pub records: Vec<Record>,
}

impl UploadRequest {
    /// Build the request for a batch.
    pub fn new(
        device_id: impl Into<DeviceId>,
        identity: Option<IdentitySnapshot>,
        batch: &Batch,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            identity,
            sent_at,
            records: batch.records.clone(),
        }
    }

    /// App ID the request is sent on behalf of.
    ///
    /// The records' app ID wins, since the collector checks every record
    /// against it; the identity's is used for an empty request.
    pub fn app_id(&self) -> Option<&str> {
        self.records
            .first()
            .map(|r| r.identity.app_id.as_str())
            .or_else(|| self.identity.as_ref().map(|i| i.app_id.as_str()))
    }
}

/// Response of the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Highest acknowledged sequence
    pub acked_through: Sequence,
}

/// Errors from a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::TransmissionFailed(err.to_string())
    }
}

/// Something that can deliver an upload to the collection endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one upload and return the endpoint's acknowledgment.
    async fn send(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError>;
}

/// HTTP transport using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport posting to `endpoint`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("approver-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(app_id) = request.app_id() {
            builder = builder.bearer_auth(app_id);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<UploadResponse>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}
