//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of
//! the `AuthBackend` and `FavoritesRepository` ports from the `core` crate. It
//! handles all interactions with the PostgreSQL database using `sqlx`.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use book_finder_core::domain::{FavoriteEntry, Session, User};
use book_finder_core::normalize;
use book_finder_core::ports::{
    AuthBackend, AuthError, AuthResult, FavoritesRepository, PersistenceError, PersistenceResult,
};
use book_finder_core::session::MIN_PASSWORD_LEN;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the auth and favorites ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    session_ttl: Duration,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool, session_ttl_days: i64) -> Self {
        Self {
            pool,
            session_ttl: Duration::days(session_ttl_days),
        }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn create_auth_session(&self, user: User) -> AuthResult<Session> {
        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.session_ttl;

        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&token)
            .bind(user.id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(network)?;

        Ok(Session {
            token,
            user,
            expires_at,
        })
    }
}

fn network(e: sqlx::Error) -> AuthError {
    error!("Auth query failed: {:?}", e);
    AuthError::Network(e.to_string())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    email: String,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            id: self.id,
            email: self.email,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    id: Uuid,
    email: String,
    hashed_password: String,
}

#[derive(FromRow)]
struct SessionRecord {
    id: String,
    user_id: Uuid,
    email: String,
    expires_at: DateTime<Utc>,
}
impl SessionRecord {
    fn to_domain(self) -> Session {
        Session {
            token: self.id,
            user: User {
                id: self.user_id,
                email: self.email,
            },
            expires_at: self.expires_at,
        }
    }
}

#[derive(FromRow)]
struct FavoriteRecord {
    user_id: Uuid,
    book_id: String,
    snapshot: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}
impl FavoriteRecord {
    /// Stored snapshots go through normalization again like any other record.
    fn to_domain(self) -> FavoriteEntry {
        FavoriteEntry {
            user_id: self.user_id,
            snapshot: normalize(&self.snapshot.0),
            book_id: self.book_id,
            created_at: self.created_at,
        }
    }
}

//=========================================================================================
// `AuthBackend` Trait Implementation
//=========================================================================================

#[async_trait]
impl AuthBackend for DbAdapter {
    async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Session> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let salt = SaltString::generate(&mut OsRng);
        let hashed_password = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                error!("Failed to hash password: {:?}", e);
                AuthError::Network(format!("password hashing failed: {}", e))
            })?
            .to_string();

        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (id, email, hashed_password) VALUES ($1, $2, $3) \
             ON CONFLICT (email) DO NOTHING RETURNING id, email",
        )
        .bind(Uuid::new_v4())
        .bind(normalize_email(email))
        .bind(&hashed_password)
        .fetch_optional(&self.pool)
        .await
        .map_err(network)?
        .ok_or(AuthError::EmailTaken)?;

        self.create_auth_session(record.to_domain()).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Session> {
        let creds = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT id, email, hashed_password FROM users WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await
        .map_err(network)?
        .ok_or(AuthError::InvalidCredentials)?;

        let parsed_hash = PasswordHash::new(&creds.hashed_password).map_err(|e| {
            error!("Failed to parse password hash: {:?}", e);
            AuthError::InvalidCredentials
        })?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| AuthError::InvalidCredentials)?;

        self.create_auth_session(User {
            id: creds.id,
            email: creds.email,
        })
        .await
    }

    async fn sign_out(&self, token: &str) -> AuthResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(network)?;
        Ok(())
    }

    async fn resolve_session(&self, token: &str) -> AuthResult<Option<Session>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT s.id, s.user_id, u.email, s.expires_at \
             FROM auth_sessions s JOIN users u ON u.id = s.user_id \
             WHERE s.id = $1 AND s.expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(network)?;

        Ok(record.map(SessionRecord::to_domain))
    }
}

//=========================================================================================
// `FavoritesRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl FavoritesRepository for DbAdapter {
    async fn select_by_user(&self, user_id: Uuid) -> PersistenceResult<Vec<FavoriteEntry>> {
        let records = sqlx::query_as::<_, FavoriteRecord>(
            "SELECT user_id, book_id, snapshot, created_at FROM favorites \
             WHERE user_id = $1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::ReadFailed(e.to_string()))?;

        debug!(%user_id, count = records.len(), "Fetched favorites rows");
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn insert(&self, entry: &FavoriteEntry) -> PersistenceResult<()> {
        sqlx::query(
            "INSERT INTO favorites (user_id, book_id, snapshot, created_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, book_id) DO NOTHING",
        )
        .bind(entry.user_id)
        .bind(&entry.book_id)
        .bind(Json(&entry.snapshot))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, user_id: Uuid, book_id: &str) -> PersistenceResult<()> {
        sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND book_id = $2")
            .bind(user_id)
            .bind(book_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}
