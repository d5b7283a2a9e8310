//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for user signup, login, logout and the current
//! session.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use book_finder_core::{Session, SessionState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::web::middleware::{session_cookie, SESSION_COOKIE};
use crate::web::state::{AppState, BrowsingContext};

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for AuthResponse {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user.id,
            email: session.user.email.clone(),
            expires_at: session.expires_at,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unknown,
    Absent,
    Authenticated,
}

#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub status: SessionStatus,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl From<&SessionState> for SessionResponse {
    fn from(state: &SessionState) -> Self {
        let status = match state {
            SessionState::Unknown => SessionStatus::Unknown,
            SessionState::Absent => SessionStatus::Absent,
            SessionState::Authenticated(_) => SessionStatus::Authenticated,
        };
        Self {
            status,
            user_id: state.user().map(|u| u.id),
            email: state.user().map(|u| u.email.clone()),
        }
    }
}

//=========================================================================================
// Helpers
//=========================================================================================

fn session_set_cookie(token: &str, ttl_days: i64) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE,
        token,
        Duration::days(ttl_days).num_seconds()
    )
}

fn session_clear_cookie() -> String {
    format!("{}=; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=0", SESSION_COOKIE)
}

/// The context already attached to this browser, or a fresh one.
fn context_for_request(state: &AppState, headers: &HeaderMap) -> (Option<String>, Arc<BrowsingContext>) {
    let previous = session_cookie(headers).map(str::to_string);
    let context = previous
        .as_deref()
        .and_then(|token| state.contexts.get(token))
        .unwrap_or_else(|| state.new_context(None));
    (previous, context)
}

/// Files the context under its new token once it has signed in. The token the
/// browser held before is dropped and revoked on the backend.
async fn register_signed_in(
    state: &AppState,
    previous: Option<String>,
    context: Arc<BrowsingContext>,
    session: &Session,
) -> [(header::HeaderName, String); 1] {
    state.contexts.insert(session.token.clone(), context);
    if let Some(previous) = previous.filter(|previous| *previous != session.token) {
        state.contexts.remove(&previous);
        if let Err(e) = state.auth.sign_out(&previous).await {
            warn!(error = %e, "Could not revoke the replaced session token");
        }
    }
    [(
        header::SET_COOKIE,
        session_set_cookie(&session.token, state.config.session_ttl_days),
    )]
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a new user account
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "User created successfully", body = AuthResponse),
        (status = 400, description = "Password too short"),
        (status = 409, description = "Email already registered"),
        (status = 503, description = "Auth backend unavailable")
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (previous, context) = context_for_request(&state, &headers);
    let session = context.session.sign_up(&req.email, &req.password).await?;
    info!(user_id = %session.user.id, "User signed up");

    let cookie = register_signed_in(&state, previous, context, &session).await;
    Ok((StatusCode::CREATED, cookie, Json(AuthResponse::from(&session))))
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 503, description = "Auth backend unavailable")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (previous, context) = context_for_request(&state, &headers);
    let session = context.session.sign_in(&req.email, &req.password).await?;

    let cookie = register_signed_in(&state, previous, context, &session).await;
    Ok((StatusCode::OK, cookie, Json(AuthResponse::from(&session))))
}

/// POST /auth/logout - Logout and invalidate session
///
/// The local session is always cleared, so this answers 200 even when the
/// backend could not revoke the token.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(token) = session_cookie(&headers) {
        let result = match state.contexts.remove(token) {
            Some(context) => context.session.sign_out().await,
            None => state.auth.sign_out(token).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "Remote sign out failed; cookie cleared anyway");
        }
    }
    (StatusCode::OK, [(header::SET_COOKIE, session_clear_cookie())])
}

/// GET /auth/session - Report the session behind the cookie
#[utoipa::path(
    get,
    path = "/auth/session",
    responses(
        (status = 200, description = "Current session state", body = SessionResponse)
    )
)]
pub async fn session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<SessionResponse> {
    let resolved = match session_cookie(&headers) {
        None => SessionState::Absent,
        Some(token) => {
            state
                .active_context(token)
                .await
                .session
                .wait_resolved(state.config.session_resolve_wait)
                .await
        }
    };
    Json(SessionResponse::from(&resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::state::tests::test_state;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use book_finder_core::AuthError;

    fn cookie_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("session={}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_login_registers_context_and_sets_cookie() {
        let (state, _backend) = test_state();
        let response = login_handler(
            State(state.clone()),
            HeaderMap::new(),
            Json(LoginRequest {
                email: "reader@example.com".to_string(),
                password: "secret123".to_string(),
            }),
        )
        .await
        .unwrap()
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("session="));
        assert!(cookie.contains("Max-Age=2592000"));
        assert_eq!(state.contexts.len(), 1);
    }

    #[tokio::test]
    async fn test_login_revokes_previous_token() {
        let (state, backend) = test_state();
        let login = || LoginRequest {
            email: "reader@example.com".to_string(),
            password: "secret123".to_string(),
        };
        let first = login_handler(State(state.clone()), HeaderMap::new(), Json(login()))
            .await
            .unwrap()
            .into_response();
        let first_cookie = first.headers()[header::SET_COOKIE].to_str().unwrap();
        let old_token = first_cookie
            .split(';')
            .next()
            .and_then(|c| c.strip_prefix("session="))
            .unwrap()
            .to_string();

        let second = login_handler(State(state.clone()), cookie_headers(&old_token), Json(login()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(second.status(), StatusCode::OK);

        let resolved = book_finder_core::AuthBackend::resolve_session(backend.as_ref(), &old_token)
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert!(state.contexts.get(&old_token).is_none());
        assert_eq!(state.contexts.len(), 1);
    }

    #[tokio::test]
    async fn test_signup_rejects_short_password() {
        let (state, _backend) = test_state();
        let err = signup_handler(
            State(state.clone()),
            HeaderMap::new(),
            Json(SignupRequest {
                email: "new@example.com".to_string(),
                password: "123".to_string(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ApiError::Auth(AuthError::WeakPassword)));
        assert!(state.contexts.is_empty());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_remote_fails() {
        let (state, backend) = test_state();
        let context = state.new_context(None);
        let session = context.session.sign_in("reader@example.com", "secret123").await.unwrap();
        state.contexts.insert(session.token.clone(), context.clone());
        backend.fail_sign_out(true);

        let response = logout_handler(State(state.clone()), cookie_headers(&session.token))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert!(state.contexts.is_empty());
        assert_eq!(context.session.state(), SessionState::Absent);
    }

    #[tokio::test]
    async fn test_session_reports_status() {
        let (state, backend) = test_state();
        let Json(anonymous) = session_handler(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(anonymous.status, SessionStatus::Absent);

        let session = book_finder_core::AuthBackend::sign_in(
            backend.as_ref(),
            "reader@example.com",
            "secret123",
        )
        .await
        .unwrap();
        let Json(current) = session_handler(State(state.clone()), cookie_headers(&session.token)).await;
        assert_eq!(current.status, SessionStatus::Authenticated);
        assert_eq!(current.email.as_deref(), Some("reader@example.com"));
    }
}
