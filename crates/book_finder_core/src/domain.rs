//! crates/book_finder_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or HTTP format; the only
//! serialization they carry is the canonical JSON shape of a book.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A provider-specific book record, exactly as it came off the wire.
pub type RawRecord = serde_json::Value;

// Represents a user - used throughout app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

/// An authenticated identity: the opaque token plus the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The resolution state of the session for one browsing instance.
///
/// `Unknown` means nothing has been resolved yet; `Absent` means it was
/// resolved and nobody is signed in. Consumers must treat them differently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Absent,
    Authenticated(Session),
}

impl SessionState {
    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::Authenticated(session) => Some(&session.user),
            _ => None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Authenticated(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, SessionState::Unknown)
    }
}

/// The normalized, provider-agnostic representation of a book.
///
/// Built only by [`crate::catalog::normalize`]; the fields are private so a
/// value cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBook {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) authors: Vec<String>,
    pub(crate) thumbnail_url: String,
    pub(crate) rating: f64,
    pub(crate) categories: Vec<String>,
    pub(crate) published_year: String,
}

impl CanonicalBook {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn authors(&self) -> &[String] {
        &self.authors
    }

    pub fn thumbnail_url(&self) -> &str {
        &self.thumbnail_url
    }

    /// Average rating; `0.0` when the provider had none.
    pub fn rating(&self) -> f64 {
        self.rating
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Four-digit year as text, or `"Unknown"`.
    pub fn published_year(&self) -> &str {
        &self.published_year
    }
}

/// A single saved book for a single user.
#[derive(Debug, Clone, PartialEq)]
pub struct FavoriteEntry {
    pub user_id: Uuid,
    pub book_id: String,
    pub snapshot: CanonicalBook,
    pub created_at: DateTime<Utc>,
}

/// Paging for catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub limit: u32,
    pub offset: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}
