//! Push permission request.
//!
//! Showing the permission prompt is the host's job. The engine hands the
//! host's [`PushAuthorizer`] the requested options and a one-shot
//! [`AuthorizationResponder`], and gives the caller a [`PermissionRequest`]
//! to await the answer on.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// What the permission prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationOptions {
    pub alert: bool,
    pub sound: bool,
    pub badge: bool,
}

impl Default for AuthorizationOptions {
    fn default() -> Self {
        Self {
            alert: true,
            sound: true,
            badge: true,
        }
    }
}

/// Host-side collaborator that shows the permission prompt.
pub trait PushAuthorizer: Send + Sync {
    /// Ask the user; call `responder.respond` once an answer exists.
    fn request_authorization(&self, options: AuthorizationOptions, responder: AuthorizationResponder);
}

impl<F> PushAuthorizer for F
where
    F: Fn(AuthorizationOptions, AuthorizationResponder) + Send + Sync,
{
    fn request_authorization(&self, options: AuthorizationOptions, responder: AuthorizationResponder) {
        self(options, responder)
    }
}

/// Completes a [`PermissionRequest`]. Dropping it unanswered cancels the
/// request.
#[derive(Debug)]
pub struct AuthorizationResponder {
    tx: oneshot::Sender<bool>,
}

impl AuthorizationResponder {
    /// Deliver the user's answer.
    pub fn respond(self, granted: bool) {
        if self.tx.send(granted).is_err() {
            tracing::debug!(granted, "permission answer arrived after the request was dropped");
        }
    }
}

/// Pending answer to a permission prompt.
#[derive(Debug)]
pub struct PermissionRequest {
    rx: oneshot::Receiver<bool>,
    shutdown: CancellationToken,
}

impl PermissionRequest {
    /// Wait for the answer.
    ///
    /// Returns [`Error::Cancelled`] if the responder is dropped without an
    /// answer or the engine shuts down first.
    pub async fn granted(self) -> Result<bool> {
        tokio::select! {
            biased;
            answer = self.rx => answer.map_err(|_| Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Create a connected responder and request.
pub fn permission_channel(shutdown: CancellationToken) -> (AuthorizationResponder, PermissionRequest) {
    let (tx, rx) = oneshot::channel();
    (
        AuthorizationResponder { tx },
        PermissionRequest { rx, shutdown },
    )
}
