//! Shared-token session gate.
//!
//! `POST /auth/login` trades the shared token for an HttpOnly session
//! cookie; every `/api/*` route passes through [`require_session`].

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::sync::Arc;

/// Session lifetime.
const SESSION_MAX_AGE_SECS: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// `None` rejects every login.
    token: Option<String>,
    cookie_name: String,
}

impl AuthSettings {
    pub fn new(token: Option<String>, cookie_name: impl Into<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            cookie_name: cookie_name.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env::var("SHARED_TOKEN").ok(),
            env::var("COOKIE_NAME").unwrap_or_else(|_| "irrigation_session".to_string()),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    fn accepts(&self, candidate: &str) -> bool {
        match &self.token {
            Some(token) => constant_time_eq(token.as_bytes(), candidate.as_bytes()),
            None => false,
        }
    }

    fn session_cookie(&self, value: &str) -> String {
        format!(
            "{}={value}; HttpOnly; Secure; SameSite=Strict; Max-Age={SESSION_MAX_AGE_SECS}; Path=/",
            self.cookie_name
        )
    }

    fn cleared_cookie(&self) -> String {
        format!(
            "{}=; HttpOnly; Secure; SameSite=Strict; Max-Age=0; Path=/",
            self.cookie_name
        )
    }

    /// Whether the request carries a valid session cookie.
    fn has_session(&self, headers: &HeaderMap) -> bool {
        cookie_value(headers, &self.cookie_name).is_some_and(|v| self.accepts(v))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// First value of cookie `name` across all `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AuthError {
    InvalidToken,
    NoSession,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::InvalidToken => "Invalid token",
            AuthError::NoSession => "Unauthorized",
        };
        (StatusCode::UNAUTHORIZED, Json(json!({ "message": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(auth: Arc<AuthSettings>) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/check", get(check))
        .route("/auth/logout", post(logout))
        .with_state(auth)
}

#[derive(Deserialize)]
struct LoginRequest {
    token: String,
}

async fn login(
    State(auth): State<Arc<AuthSettings>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    if !auth.accepts(&body.token) {
        tracing::warn!("login rejected");
        return Err(AuthError::InvalidToken);
    }
    Ok((
        [(header::SET_COOKIE, auth.session_cookie(&body.token))],
        Json(json!({ "success": true })),
    )
        .into_response())
}

async fn check(
    State(auth): State<Arc<AuthSettings>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AuthError> {
    if auth.has_session(&headers) {
        Ok(Json(json!({ "valid": true })))
    } else {
        Err(AuthError::NoSession)
    }
}

async fn logout(State(auth): State<Arc<AuthSettings>>) -> Response {
    (
        [(header::SET_COOKIE, auth.cleared_cookie())],
        Json(json!({ "success": true })),
    )
        .into_response()
}

/// Middleware: reject requests without a valid session cookie.
pub async fn require_session(
    State(auth): State<Arc<AuthSettings>>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !auth.has_session(req.headers()) {
        return Err(AuthError::NoSession);
    }
    Ok(next.run(req).await)
}

// ===========================================================================
// Tests
// ===========================================================================
