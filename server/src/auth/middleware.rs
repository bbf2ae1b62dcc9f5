//! App authentication.
//!
//! SDKs authenticate with their app ID as a Bearer token. When
//! `ALLOWED_APP_IDS` is set, only those apps are accepted.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated app extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthApp {
    /// The app ID from the bearer token
    pub app_id: String,
}

impl FromRequestParts<AppState> for AuthApp {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header {
            Some(header) if header.starts_with("Bearer ") => {
                let app_id = header.trim_start_matches("Bearer ").trim().to_string();
                if app_id.is_empty() {
                    return Err(AppError::Unauthorized("empty bearer token"));
                }

                if !state.config.is_app_allowed(&app_id) {
                    tracing::warn!(%app_id, "rejected upload from unknown app");
                    return Err(AppError::Forbidden(format!("app {} is not allowed", app_id)));
                }

                Ok(AuthApp { app_id })
            }
            Some(_) => Err(AppError::Unauthorized("invalid authorization header format")),
            None => Err(AppError::Unauthorized("missing authorization header")),
        }
    }
}
