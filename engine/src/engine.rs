//! The engine facade.
//!
//! [`Engine`] is the single entry point the SDK surface talks to. It
//! validates state, stamps records with the current identity, appends them
//! to the buffer and wakes the dispatcher. All methods take `&self` and may
//! be called from any thread.

use crate::dispatcher::{DispatchPolicy, DispatchShared, DispatchStats, Dispatcher};
use crate::journal::{FileJournal, Journal, MemoryJournal};
use crate::payload::{
    apply_best_attempt_content, extract_push_payload, NotificationContent, NotificationRequest,
};
use crate::permission::{permission_channel, AuthorizationOptions, PermissionRequest, PushAuthorizer};
use crate::transport::{HttpTransport, Transport};
use crate::{
    error::Result, Attributes, BufferStats, DeadLetter, DeadLetterStore, DeviceId, EngineConfig,
    Error, EventBuffer, IdentityStore, PushPayload, PushToken, RecordBody, Sequence,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The delivery engine.
///
/// Owns the buffer, the identity and the background dispatcher task. Must
/// be opened inside a tokio runtime. Dropping the engine stops the
/// dispatcher; [`Engine::shutdown`] also waits for it.
pub struct Engine {
    config: EngineConfig,
    identity: Arc<IdentityStore>,
    buffer: Arc<EventBuffer>,
    dead_letters: Arc<DeadLetterStore>,
    dispatch: Arc<DispatchShared>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("device_id", self.identity.device_id())
            .field("initialized", &self.identity.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open an engine delivering through `transport`.
    ///
    /// Restores pending records from `config.storage_dir` when set and
    /// starts the dispatcher on the current runtime.
    pub fn open(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("engine must be opened inside a tokio runtime".into()))?;

        let fresh_device_id = config
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (journal, dead_letters): (Box<dyn Journal>, DeadLetterStore) = match &config.storage_dir
        {
            Some(dir) => (
                Box::new(FileJournal::open(dir, config.sync_writes)?),
                DeadLetterStore::in_dir(dir)?,
            ),
            None => (Box::new(MemoryJournal::new()), DeadLetterStore::in_memory()),
        };

        let buffer = Arc::new(EventBuffer::open(
            journal,
            fresh_device_id,
            config.buffer_capacity,
            config.compact_after,
        )?);
        let identity = Arc::new(IdentityStore::new(buffer.device_id()));
        let dead_letters = Arc::new(dead_letters);

        let dispatcher = Dispatcher::new(
            Arc::clone(&buffer),
            Arc::clone(&identity),
            transport,
            Arc::clone(&dead_letters),
            DispatchPolicy::from(&config),
        );
        let dispatch = dispatcher.shared();
        let shutdown = CancellationToken::new();
        let worker = runtime.spawn(dispatcher.run(shutdown.clone()));

        tracing::info!(
            device_id = %identity.device_id(),
            durable = buffer.stats().durable,
            pending = buffer.len(),
            "engine opened"
        );

        Ok(Self {
            config,
            identity,
            buffer,
            dead_letters,
            dispatch,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open an engine posting to `config.endpoint` over HTTP.
    pub fn with_http(config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout())?;
        Self::open(config, Arc::new(transport))
    }

    /// Set the application ID. Calling again replaces it.
    pub fn initialize(&self, app_id: &str) -> Result<()> {
        self.identity.set_application_id(app_id)?;
        tracing::info!(app_id = %app_id.trim(), "engine initialized");
        // Records restored from a previous run can go out now
        if !self.buffer.is_empty() {
            self.dispatch.notify();
        }
        Ok(())
    }

    /// Check whether [`Engine::initialize`] was called.
    pub fn is_initialized(&self) -> bool {
        self.identity.is_initialized()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.identity.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn enqueue(&self, body: RecordBody) -> Result<Sequence> {
        let identity = self.identity.snapshot()?;
        let kind = body.kind();
        let outcome = self.buffer.append(body, identity)?;

        if let Some(evicted) = outcome.evicted {
            self.dispatch.report(Error::BufferFull {
                evicted,
                dropped: outcome.dropped,
            });
        }
        tracing::trace!(sequence = outcome.sequence, kind, "record enqueued");

        self.dispatch.notify();
        Ok(outcome.sequence)
    }

    /// Register the device's push token, or clear it with `None`.
    pub fn set_push_token(&self, token: Option<PushToken>) -> Result<Sequence> {
        self.ensure_initialized()?;
        if let Some(token) = &token {
            if token.token().trim().is_empty() {
                return Err(Error::InvalidArgument("push token must not be empty".into()));
            }
        }
        let previous = self.identity.push_token();
        self.identity.set_push_token(token.clone());
        self.enqueue(RecordBody::PushTokenUpdate { token })
            .inspect_err(|_| self.identity.set_push_token(previous))
    }

    /// Log a named event.
    pub fn log_event(&self, name: &str, attributes: Attributes) -> Result<Sequence> {
        self.ensure_initialized()?;
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("event name must not be empty".into()));
        }
        self.enqueue(RecordBody::Event {
            name: name.to_string(),
            attributes,
        })
    }

    /// Log a named event with a single value.
    pub fn log_event_value(&self, name: &str, value: &str) -> Result<Sequence> {
        let attributes = Attributes::from([("value".to_string(), value.to_string())]);
        self.log_event(name, attributes)
    }

    /// Log user attributes. Uploaded immediately.
    pub fn log_user_info(&self, attributes: Attributes) -> Result<Sequence> {
        self.ensure_initialized()?;
        self.enqueue(RecordBody::UserAttributes { attributes })
    }

    /// Identify the user. Uploaded immediately.
    pub fn log_user(&self, email: &str, id: Option<&str>) -> Result<Sequence> {
        self.ensure_initialized()?;
        let email = email.trim();
        if email.is_empty() {
            return Err(Error::InvalidArgument("user email must not be empty".into()));
        }

        let previous = self.identity.snapshot()?;
        self.identity
            .set_user(id.map(str::to_string), Some(email.to_string()));

        let mut attributes = Attributes::from([("email".to_string(), email.to_string())]);
        if let Some(id) = id {
            attributes.insert("id".to_string(), id.to_string());
        }
        self.enqueue(RecordBody::UserAttributes { attributes })
            .inspect_err(|_| self.identity.set_user(previous.user_id, previous.user_email))
    }

    /// Log a received push. Uploaded immediately.
    pub fn log_push(&self, payload: &Value) -> Result<Sequence> {
        self.ensure_initialized()?;
        let payload = PushPayload::parse(payload)?;
        self.enqueue(RecordBody::PushReceipt { payload })
    }

    /// Handle a notification service extension request.
    ///
    /// Logs the push receipt and returns the content to display.
    pub fn receive_extension_request(
        &self,
        request: &NotificationRequest,
    ) -> Result<NotificationContent> {
        self.ensure_initialized()?;
        let receipt = extract_push_payload(request)?;
        self.enqueue(receipt)?;
        Ok(apply_best_attempt_content(&request.content))
    }

    /// Content to display when the extension runs out of time.
    pub fn service_extension_time_will_expire(
        &self,
        request: &NotificationRequest,
    ) -> NotificationContent {
        apply_best_attempt_content(&request.content)
    }

    /// Ask the host to prompt for push permission.
    ///
    /// The returned request resolves with the user's answer, or with
    /// [`Error::Cancelled`] if the engine shuts down first.
    pub fn request_push_authorization(
        &self,
        authorizer: &dyn PushAuthorizer,
        options: AuthorizationOptions,
    ) -> PermissionRequest {
        let (responder, request) = permission_channel(self.shutdown.child_token());
        authorizer.request_authorization(options, responder);
        request
    }

    /// Send everything queued now instead of waiting for the next cycle.
    pub fn flush(&self) {
        self.dispatch.request_flush();
    }

    /// Buffer counters.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Delivery counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatch.stats()
    }

    /// Records that exhausted their retries.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.dead_letters.entries()
    }

    /// Subscribe to background errors: `BufferFull`, `TransmissionFailed`
    /// and `DeadLettered`.
    pub fn subscribe(&self) -> broadcast::Receiver<Error> {
        self.dispatch.subscribe()
    }

    /// Device ID records are sent under.
    pub fn device_id(&self) -> &DeviceId {
        self.identity.device_id()
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop the dispatcher and wait for it.
    ///
    /// A send in progress is cancelled and its records stay queued.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "dispatcher task failed");
            }
        }
        self.buffer.compact()?;
        tracing::info!(pending = self.buffer.len(), "engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
