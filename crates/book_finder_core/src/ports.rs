//! crates/book_finder_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{FavoriteEntry, RawRecord, SearchOptions, Session};

//=========================================================================================
// Port Error and Result Types
//=========================================================================================

/// Failures of the authentication backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error("Password does not meet the minimum requirements")]
    WeakPassword,
    #[error("Auth backend unreachable: {0}")]
    Network(String),
}

/// Failures of the external book catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Upstream request timed out")]
    Timeout,
    #[error("Upstream transport error: {0}")]
    Transport(String),
}

/// Failures of the remote favorites table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to write favorites: {0}")]
    WriteFailed(String),
    #[error("Failed to read favorites: {0}")]
    ReadFailed(String),
}

pub type AuthResult<T> = Result<T, AuthError>;
pub type UpstreamResult<T> = Result<T, UpstreamError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Session>;

    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Session>;

    async fn sign_out(&self, token: &str) -> AuthResult<()>;

    /// Resolves a persisted token. `Ok(None)` means the token is unknown or expired.
    async fn resolve_session(&self, token: &str) -> AuthResult<Option<Session>>;
}

/// Row-level access to the favorites table, keyed by `(user_id, book_id)`.
#[async_trait]
pub trait FavoritesRepository: Send + Sync {
    /// All entries for a user, oldest first.
    async fn select_by_user(&self, user_id: Uuid) -> PersistenceResult<Vec<FavoriteEntry>>;

    async fn insert(&self, entry: &FavoriteEntry) -> PersistenceResult<()>;

    async fn delete(&self, user_id: Uuid, book_id: &str) -> PersistenceResult<()>;
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Keyword search. An empty result is not an error.
    async fn search(&self, query: &str, options: SearchOptions) -> UpstreamResult<Vec<RawRecord>>;

    async fn fetch_by_id(&self, id: &str) -> UpstreamResult<RawRecord>;

    /// Records filed under a subject, used for category browsing.
    async fn fetch_subject(
        &self,
        subject: &str,
        options: SearchOptions,
    ) -> UpstreamResult<Vec<RawRecord>>;
}
