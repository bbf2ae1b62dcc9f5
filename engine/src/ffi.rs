//! FFI layer for native SDK integration.
//!
//! This module provides C-compatible functions that can be called from Swift,
//! Kotlin or Dart. All data crosses the boundary as JSON strings.
//!
//! # Memory Management
//!
//! - Strings returned by `approver_*` functions are allocated by Rust
//! - Caller must free them with `approver_string_free`
//! - Engine pointers must be freed with `approver_engine_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure
//!
//! # Runtime
//!
//! Each engine owns a small tokio runtime that drives its dispatcher, so
//! callers never need an async context of their own.

use crate::{
    apply_best_attempt_content, extract_push_payload, Attributes, BufferStats, DispatchStats,
    Engine, EngineConfig, NotificationContent, NotificationRequest, PushService, PushToken,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// Result wrapper for FFI responses.
#[derive(Serialize)]
#[serde(untagged)]
enum FfiResult<T: Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn err(message: impl Into<String>) -> Self {
        FfiResult::Err {
            error: message.into(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e))
    }
}

impl<T: Serialize> From<crate::error::Result<T>> for FfiResult<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(value) => FfiResult::ok(value),
            Err(e) => FfiResult::err(e.to_string()),
        }
    }
}

/// An engine together with the runtime that drives it.
pub struct FfiEngine {
    // Dropped before the runtime
    engine: Engine,
    runtime: tokio::runtime::Runtime,
}

/// Combined counters returned by `approver_stats`.
#[derive(Serialize)]
struct Stats {
    buffer: BufferStats,
    dispatch: DispatchStats,
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `approver_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => CString::new(r#"{"error":"string contained null bytes"}"#)
            .unwrap_or_default()
            .into_raw(),
    }
}

fn error_string(message: impl Into<String>) -> *mut c_char {
    to_c_string(FfiResult::<()>::err(message).to_json())
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Parse optional JSON; a null pointer yields the default value.
unsafe fn parse_json_or_default<T: DeserializeOwned + Default>(
    ptr: *const c_char,
) -> Result<T, String> {
    if ptr.is_null() {
        return Ok(T::default());
    }
    let json = from_c_string(ptr).ok_or("invalid UTF-8")?;
    serde_json::from_str(&json).map_err(|e| format!("parse error: {}", e))
}

// ============================================================================
// Engine Lifecycle
// ============================================================================

/// Create a new engine.
///
/// # Arguments
/// - `config_json`: JSON string of EngineConfig, or null for defaults
///
/// # Returns
/// Pointer to the engine, or null on failure.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string or null
/// - Caller must free the returned pointer with `approver_engine_free`
#[no_mangle]
pub unsafe extern "C" fn approver_engine_new(config_json: *const c_char) -> *mut FfiEngine {
    let config: EngineConfig = match parse_json_or_default(config_json) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid engine configuration");
            return ptr::null_mut();
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("approver-dispatch")
        .enable_all()
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ptr::null_mut();
        }
    };

    let engine = {
        let _guard = runtime.enter();
        match Engine::with_http(config) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "failed to open engine");
                return ptr::null_mut();
            }
        }
    };

    Box::into_raw(Box::new(FfiEngine { engine, runtime }))
}

/// Shut down and free an engine.
///
/// Pending records stay in the journal for the next run.
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new`
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn approver_engine_free(engine: *mut FfiEngine) {
    if engine.is_null() {
        return;
    }
    let ffi = Box::from_raw(engine);
    if let Err(e) = ffi.runtime.block_on(ffi.engine.shutdown()) {
        tracing::warn!(error = %e, "engine shutdown failed");
    }
    drop(ffi);
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from an `approver_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn approver_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Get the engine version.
///
/// # Safety
/// Caller must free the returned string with `approver_string_free`.
#[no_mangle]
pub unsafe extern "C" fn approver_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION").to_string())
}

// ============================================================================
// Facade Operations
// ============================================================================

/// Set the application ID.
///
/// # Returns
/// JSON string: `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `app_id` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_initialize(
    engine: *const FfiEngine,
    app_id: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let app_id = match from_c_string(app_id) {
        Some(s) => s,
        None => return error_string("invalid app id"),
    };

    to_c_string(FfiResult::from(ffi.engine.initialize(&app_id)).to_json())
}

/// Register or clear the push token.
///
/// # Arguments
/// - `service`: `"apns"`, `"firebase"` or `"custom"`
/// - `token`: the token, or null to clear it
/// - `extra_json`: JSON object describing a custom service, or null
///
/// # Returns
/// JSON string: `{"ok": sequence}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `service`, `token` and `extra_json` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_set_push_token(
    engine: *const FfiEngine,
    service: *const c_char,
    token: *const c_char,
    extra_json: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let token = if token.is_null() {
        None
    } else {
        let token = match from_c_string(token) {
            Some(s) => s,
            None => return error_string("invalid token"),
        };
        let service: PushService = match from_c_string(service)
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok())
        {
            Some(s) => s,
            None => return error_string("unknown push service"),
        };
        let extra: Option<Attributes> = match parse_json_or_default(extra_json) {
            Ok(e) => e,
            Err(e) => return error_string(e),
        };
        Some(PushToken::from_parts(service, token, extra))
    };

    to_c_string(FfiResult::from(ffi.engine.set_push_token(token)).to_json())
}

/// Log a named event.
///
/// # Arguments
/// - `attributes_json`: JSON object of string attributes, or null
///
/// # Returns
/// JSON string: `{"ok": sequence}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `name` and `attributes_json` must be valid null-terminated C strings or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_log_event(
    engine: *const FfiEngine,
    name: *const c_char,
    attributes_json: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let name = match from_c_string(name) {
        Some(s) => s,
        None => return error_string("invalid event name"),
    };

    let attributes: Attributes = match parse_json_or_default(attributes_json) {
        Ok(a) => a,
        Err(e) => return error_string(e),
    };

    to_c_string(FfiResult::from(ffi.engine.log_event(&name, attributes)).to_json())
}

/// Log user attributes. Uploaded immediately.
///
/// # Returns
/// JSON string: `{"ok": sequence}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `attributes_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_log_user_info(
    engine: *const FfiEngine,
    attributes_json: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let attributes: Attributes = match parse_json_or_default(attributes_json) {
        Ok(a) => a,
        Err(e) => return error_string(e),
    };

    to_c_string(FfiResult::from(ffi.engine.log_user_info(attributes)).to_json())
}

/// Identify the user. Uploaded immediately.
///
/// # Returns
/// JSON string: `{"ok": sequence}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `email` must be a valid null-terminated C string or null
/// - `id` must be a valid null-terminated C string, or null when unknown
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_log_user(
    engine: *const FfiEngine,
    email: *const c_char,
    id: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let email = match from_c_string(email) {
        Some(s) => s,
        None => return error_string("invalid email"),
    };
    let id = from_c_string(id);

    to_c_string(FfiResult::from(ffi.engine.log_user(&email, id.as_deref())).to_json())
}

/// Log a received push. Uploaded immediately.
///
/// # Arguments
/// - `payload_json`: the push's `userInfo` as JSON
///
/// # Returns
/// JSON string: `{"ok": sequence}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - `payload_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_log_push(
    engine: *const FfiEngine,
    payload_json: *const c_char,
) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let payload_str = match from_c_string(payload_json) {
        Some(s) => s,
        None => return error_string("invalid payload JSON"),
    };

    let payload: serde_json::Value = match serde_json::from_str(&payload_str) {
        Ok(p) => p,
        Err(e) => return error_string(format!("parse error: {}", e)),
    };

    to_c_string(FfiResult::from(ffi.engine.log_push(&payload)).to_json())
}

/// Send everything queued without waiting for the next cycle.
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
#[no_mangle]
pub unsafe extern "C" fn approver_flush(engine: *const FfiEngine) {
    if let Some(ffi) = engine.as_ref() {
        ffi.engine.flush();
    }
}

/// Get buffer and delivery counters.
///
/// # Returns
/// JSON string: `{"ok": {"buffer": {...}, "dispatch": {...}}}` or `{"error": "message"}`
///
/// # Safety
/// - `engine` must be a valid pointer from `approver_engine_new` or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_stats(engine: *const FfiEngine) -> *mut c_char {
    let ffi = match engine.as_ref() {
        Some(e) => e,
        None => return error_string("null engine pointer"),
    };

    let stats = Stats {
        buffer: ffi.engine.buffer_stats(),
        dispatch: ffi.engine.dispatch_stats(),
    };
    to_c_string(FfiResult::ok(stats).to_json())
}

// ============================================================================
// Notification Extension Helpers
// ============================================================================

/// Parse the push carried by a notification request.
///
/// # Arguments
/// - `request_json`: JSON string of NotificationRequest
///
/// # Returns
/// JSON string: `{"ok": RecordBody}` or `{"error": "message"}`
///
/// # Safety
/// - `request_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_extract_push_payload(request_json: *const c_char) -> *mut c_char {
    let request_str = match from_c_string(request_json) {
        Some(s) => s,
        None => return error_string("invalid request JSON"),
    };

    let request: NotificationRequest = match serde_json::from_str(&request_str) {
        Ok(r) => r,
        Err(e) => return error_string(format!("parse error: {}", e)),
    };

    to_c_string(FfiResult::from(extract_push_payload(&request)).to_json())
}

/// Compute the best-attempt content for a notification.
///
/// # Arguments
/// - `content_json`: JSON string of NotificationContent
///
/// # Returns
/// JSON string: `{"ok": NotificationContent}` or `{"error": "message"}`
///
/// # Safety
/// - `content_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `approver_string_free`
#[no_mangle]
pub unsafe extern "C" fn approver_best_attempt_content(content_json: *const c_char) -> *mut c_char {
    let content_str = match from_c_string(content_json) {
        Some(s) => s,
        None => return error_string("invalid content JSON"),
    };

    let content: NotificationContent = match serde_json::from_str(&content_str) {
        Ok(c) => c,
        Err(e) => return error_string(format!("parse error: {}", e)),
    };

    to_c_string(FfiResult::ok(apply_best_attempt_content(&content)).to_json())
}
