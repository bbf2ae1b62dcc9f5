//! Identity store.
//!
//! Holds the app id, push token and user identity that outgoing records
//! are stamped with. Each field sits behind its own lock, so an update of
//! one never waits on readers of another.

use crate::{error::Result, DeviceId, Error, PushToken};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Identity copied into a record when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    /// Application identifier given to `initialize`
    pub app_id: String,
    /// Stable identifier of this installation
    pub device_id: DeviceId,
    /// Current push token, if registered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<PushToken>,
    /// Host application's user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Host application's user email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct User {
    id: Option<String>,
    email: Option<String>,
}

/// Shared identity state. One per engine.
#[derive(Debug)]
pub struct IdentityStore {
    device_id: DeviceId,
    app_id: RwLock<Option<String>>,
    push_token: RwLock<Option<PushToken>>,
    user: RwLock<User>,
}

impl IdentityStore {
    /// Create an identity for a device with nothing else set.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            app_id: RwLock::new(None),
            push_token: RwLock::new(None),
            user: RwLock::new(User::default()),
        }
    }

    /// Get the device ID.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the application ID, if initialized.
    pub fn app_id(&self) -> Option<String> {
        self.app_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check whether an application ID has been set.
    pub fn is_initialized(&self) -> bool {
        self.app_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Set the application ID. Rejects empty IDs.
    pub fn set_application_id(&self, app_id: &str) -> Result<()> {
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err(Error::InvalidArgument("app id must not be empty".into()));
        }
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = Some(app_id.to_string());
        Ok(())
    }

    /// Replace the push token. `None` clears it.
    pub fn set_push_token(&self, token: Option<PushToken>) {
        *self
            .push_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Get the current push token.
    pub fn push_token(&self) -> Option<PushToken> {
        self.push_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the user identity (id and email together).
    pub fn set_user(&self, id: Option<String>, email: Option<String>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = User { id, email };
    }

    /// Take a snapshot for a new record.
    ///
    /// Fails with [`Error::NotInitialized`] until an app ID is set.
    pub fn snapshot(&self) -> Result<IdentitySnapshot> {
        let app_id = self.app_id().ok_or(Error::NotInitialized)?;
        let user = self
            .user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        Ok(IdentitySnapshot {
            app_id,
            device_id: self.device_id.clone(),
            push_token: self.push_token(),
            user_id: user.id,
            user_email: user.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_requires_app_id() {
        let store = IdentityStore::new("device-1");
        assert!(!store.is_initialized());
        assert_eq!(store.snapshot(), Err(Error::NotInitialized));

        store.set_application_id("app-1").unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.app_id, "app-1");
        assert_eq!(snapshot.device_id, "device-1");
        assert_eq!(snapshot.push_token, None);
    }

    #[test]
    fn empty_app_id_rejected() {
        let store = IdentityStore::new("device-1");
        assert!(matches!(
            store.set_application_id("   "),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!store.is_initialized());
    }

    #[test]
    fn updates_visible_to_next_snapshot() {
        let store = IdentityStore::new("device-1");
        store.set_application_id("app-1").unwrap();
        let before = store.snapshot().unwrap();

        store.set_push_token(Some(PushToken::Apns {
            token: "beef".into(),
        }));
        store.set_user(Some("u-1".into()), Some("a@example.com".into()));
        let after = store.snapshot().unwrap();

        // Earlier snapshots are unaffected
        assert_eq!(before.push_token, None);
        assert_eq!(before.user_id, None);

        assert_eq!(after.push_token.unwrap().token(), "beef");
        assert_eq!(after.user_id.as_deref(), Some("u-1"));
        assert_eq!(after.user_email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let store = Arc::new(IdentityStore::new("device-1"));
        store.set_application_id("app-1").unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = store.snapshot().unwrap();
                        assert_eq!(snapshot.app_id, "app-1");
                    }
                })
            })
            .collect();

        for i in 0..200 {
            store.set_push_token(Some(PushToken::Firebase {
                token: format!("t-{i}"),
            }));
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.push_token().unwrap().token(), "t-199");
    }

    #[test]
    fn snapshot_omits_empty_fields() {
        let store = IdentityStore::new("device-1");
        store.set_application_id("app-1").unwrap();
        let json = serde_json::to_string(&store.snapshot().unwrap()).unwrap();
        assert_eq!(json, r#"{"appId":"app-1","deviceId":"device-1"}"#);
    }
}
