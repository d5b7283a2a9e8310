//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use book_finder_core::{AuthError, FavoritesError, PersistenceError, UpstreamError};
use serde_json::json;
use tracing::error;

use crate::config::ConfigError;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The external catalog failed or did not have the book.
    #[error("Catalog error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Favorites error: {0}")]
    Favorites(#[from] FavoritesError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents an error building the outbound HTTP client.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::InvalidCredentials) => StatusCode::UNAUTHORIZED,
            ApiError::Auth(AuthError::EmailTaken) => StatusCode::CONFLICT,
            ApiError::Auth(AuthError::WeakPassword) => StatusCode::BAD_REQUEST,
            ApiError::Auth(AuthError::Network(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(UpstreamError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Upstream(UpstreamError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream(UpstreamError::Transport(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Favorites(FavoritesError::NoActiveUser) => StatusCode::UNAUTHORIZED,
            ApiError::Favorites(FavoritesError::UserMismatch(_)) => StatusCode::FORBIDDEN,
            ApiError::Favorites(FavoritesError::Persistence(PersistenceError::WriteFailed(_)))
            | ApiError::Favorites(FavoritesError::Persistence(PersistenceError::ReadFailed(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Config(_)
            | ApiError::Database(_)
            | ApiError::Migration(_)
            | ApiError::HttpClient(_)
            | ApiError::Io(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            // Internal details stay in the logs.
            match &self {
                ApiError::Auth(_) | ApiError::Upstream(_) | ApiError::Favorites(_) => self.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_map_to_client_statuses() {
        assert_eq!(ApiError::from(AuthError::InvalidCredentials).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::from(AuthError::EmailTaken).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(AuthError::WeakPassword).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_errors_map_to_gateway_statuses() {
        assert_eq!(
            ApiError::from(UpstreamError::NotFound("OL1W".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::from(UpstreamError::Timeout).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::from(UpstreamError::Transport("reset".to_string())).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_favorites_write_failure_is_retryable() {
        let err = ApiError::from(FavoritesError::from(PersistenceError::WriteFailed("down".to_string())));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::Internal("boom".to_string()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
