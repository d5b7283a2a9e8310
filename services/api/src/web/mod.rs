pub mod auth;
pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use middleware::require_session;
pub use state::{AppState, BrowsingContext, ContextRegistry};

/// Builds the API routes. The favorites routes sit behind the session guard.
pub fn router(app_state: Arc<AppState>) -> Router {
    // Public routes (no session required)
    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/session", get(auth::session_handler))
        .route("/books/search", get(rest::search_books_handler))
        .route("/books/{id}", get(rest::get_book_handler))
        .route("/subjects/{subject}", get(rest::subject_books_handler));

    // Protected routes (signed-in session required)
    let protected_routes = Router::new()
        .route(
            "/favorites",
            get(rest::list_favorites_handler).post(rest::add_favorite_handler),
        )
        .route(
            "/favorites/{book_id}",
            get(rest::favorite_status_handler).delete(rest::remove_favorite_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_session,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::state::tests::{eager_revalidation_config, test_state, test_state_with};
    use reqwest::{header, redirect::Policy, Client, StatusCode};
    use serde_json::{json, Value};

    async fn serve(app_state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(app_state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> Client {
        Client::builder().redirect(Policy::none()).build().unwrap()
    }

    #[tokio::test]
    async fn test_favorites_redirect_without_session() {
        let (state, _backend) = test_state();
        let base = serve(state).await;

        let response = client().get(format!("{}/favorites", base)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
    }

    #[tokio::test]
    async fn test_unresolved_session_gets_retry_after() {
        let (state, _backend) = test_state();
        state
            .contexts
            .insert("restoring".to_string(), state.new_context(Some("restoring".to_string())));
        let base = serve(state).await;

        let response = client()
            .get(format!("{}/favorites", base))
            .header(header::COOKIE, "session=restoring")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn test_login_then_favorite_round_trip() {
        let (state, _backend) = test_state();
        let base = serve(state).await;
        let client = client();

        let login = client
            .post(format!("{}/auth/login", base))
            .json(&json!({ "email": "reader@example.com", "password": "secret123" }))
            .send()
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::OK);
        let set_cookie = login.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let cookie = set_cookie.split(';').next().unwrap().to_string();

        let added = client
            .post(format!("{}/favorites", base))
            .header(header::COOKIE, &cookie)
            .json(&json!({ "book": { "key": "/works/OL123W", "title": "Dune" } }))
            .send()
            .await
            .unwrap();
        assert_eq!(added.status(), StatusCode::CREATED);

        let listing: Value = client
            .get(format!("{}/favorites", base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["phase"], "loaded");
        assert_eq!(listing["favorites"][0]["book"]["id"], "OL123W");
        assert_eq!(listing["favorites"][0]["book"]["title"], "Dune");

        let logout = client
            .post(format!("{}/auth/logout", base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(logout.status(), StatusCode::OK);

        let after = client
            .get(format!("{}/favorites", base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn test_revoked_session_is_redirected() {
        let (state, backend) = test_state_with(eager_revalidation_config());
        let base = serve(state.clone()).await;
        let client = client();

        let login = client
            .post(format!("{}/auth/login", base))
            .json(&json!({ "email": "reader@example.com", "password": "secret123" }))
            .send()
            .await
            .unwrap();
        let set_cookie = login.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let token = cookie.trim_start_matches("session=").to_string();

        let before = client
            .get(format!("{}/favorites", base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(before.status(), StatusCode::OK);

        book_finder_core::AuthBackend::sign_out(backend.as_ref(), &token)
            .await
            .unwrap();

        let after = client
            .get(format!("{}/favorites", base))
            .header(header::COOKIE, &cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::SEE_OTHER);
        assert_eq!(after.headers()[header::LOCATION], "/login");
        assert!(state.contexts.is_empty());
    }
}
