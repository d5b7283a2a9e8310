//! services/api/src/web/middleware.rs
//!
//! Session middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use book_finder_core::{Guarded, Requirement};
use std::sync::Arc;
use tracing::debug;

use crate::web::state::AppState;

pub const SESSION_COOKIE: &str = "session";

/// Reads the session token out of the `Cookie` header.
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .find_map(|c| c.trim().strip_prefix("session="))
        .filter(|token| !token.is_empty())
}

/// Middleware that puts the guard in front of the favorites routes.
///
/// A session that is still restoring gets `503` with `Retry-After` rather than
/// a redirect. A signed-out, expired or revoked one is redirected to the
/// sign-in path. Otherwise the browsing context and its user are inserted into
/// the request extensions.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = session_cookie(req.headers()) else {
        return Redirect::to(&state.config.sign_in_path).into_response();
    };
    let context = state.active_context(token).await;

    let decision = context
        .guard
        .guard_resolved(
            Requirement::Authenticated,
            state.config.session_resolve_wait,
            |session| session.map(|s| s.user.clone()),
        )
        .await;

    match decision {
        Guarded::Loading => {
            debug!("Session still resolving, asking the client to retry");
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            response
        }
        Guarded::Redirect(path) => Redirect::to(&path).into_response(),
        Guarded::View(user) => {
            if let Some(user) = user {
                req.extensions_mut().insert(user);
            }
            req.extensions_mut().insert(context);
            next.run(req).await
        }
    }
}
