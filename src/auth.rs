//! JWT auth for the ops API.
//!
//! Accepts `Authorization: <JWT>` and `Authorization: Bearer <JWT>` headers
//! against a process-wide secret and algorithm. A missing header is 401, a
//! token that fails to decode (or has expired) is 400, and admin-gated
//! handlers return 403 for anyone but the configured admin.

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthError {
    pub status: StatusCode,
    pub message: String,
}

impl AuthError {
    fn auth_required() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "auth required".to_string(),
        }
    }

    fn invalid_token() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "token is invalid".to_string(),
        }
    }

    fn admin_required() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "admin rights required".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "status": "error", "message": self.message })),
        )
            .into_response()
    }
}

#[derive(Clone)]
pub struct AuthSettings {
    pub secret: String,
    pub algorithm: Algorithm,
    pub admin_username: String,
}

impl AuthSettings {
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let algorithm = config
            .jwt_algorithm
            .parse::<Algorithm>()
            .ok()
            .with_context(|| format!("unsupported JWT algorithm {:?}", config.jwt_algorithm))?;
        Ok(Self {
            secret: config.jwt_secret.clone(),
            algorithm,
            admin_username: config.admin_username.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub user_id: String,
}

pub fn authenticate(header: Option<&str>, settings: &AuthSettings) -> Result<Claims, AuthError> {
    let header = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(AuthError::auth_required)?;

    // accept both "Bearer <token>" and bare "<token>" headers
    let token = if header.to_lowercase().contains("bearer") {
        header
            .split_whitespace()
            .nth(1)
            .ok_or_else(AuthError::invalid_token)?
    } else {
        header
    };

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.secret.as_bytes()),
        &Validation::new(settings.algorithm),
    )
    .map_err(|_| AuthError::invalid_token())?;
    Ok(decoded.claims)
}

pub fn require_admin(claims: &Claims, settings: &AuthSettings) -> Result<(), AuthError> {
    if claims.user_id != settings.admin_username {
        return Err(AuthError::admin_required());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    AuthSettings: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let settings = AuthSettings::from_ref(state);
        let header = header_value(parts);
        async move {
            let claims = authenticate(header.as_deref(), &settings)?;
            Ok(AuthUser(claims.user_id))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub String);

impl<S> FromRequestParts<S> for AdminUser
where
    AuthSettings: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let settings = AuthSettings::from_ref(state);
        let header = header_value(parts);
        async move {
            let claims = authenticate(header.as_deref(), &settings)?;
            require_admin(&claims, &settings)?;
            Ok(AdminUser(claims.user_id))
        }
    }
}

fn header_value(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
