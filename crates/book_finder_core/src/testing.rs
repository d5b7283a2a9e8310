//! crates/book_finder_core/src/testing.rs
//!
//! An in-memory auth + favorites backend for tests, with switches for
//! injecting failures and gates for holding requests in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::catalog::normalize;
use crate::domain::{FavoriteEntry, RawRecord, Session, User};
use crate::ports::{
    AuthBackend, AuthError, AuthResult, FavoritesRepository, PersistenceError, PersistenceResult,
};
use crate::session::MIN_PASSWORD_LEN;

/// A closed semaphore lets everyone through; an open one with no permits holds them.
#[derive(Default)]
struct Gate(Mutex<Option<Arc<Semaphore>>>);

impl Gate {
    fn close(&self) {
        *self.0.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    fn open(&self) {
        if let Some(semaphore) = self.0.lock().take() {
            semaphore.close();
        }
    }

    async fn pass(&self) {
        let semaphore = self.0.lock().clone();
        if let Some(semaphore) = semaphore {
            // Acquire only returns once the gate has been opened (closed semaphore).
            let _ = semaphore.acquire().await;
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    accounts: Mutex<HashMap<String, (User, String)>>,
    sessions: Mutex<HashMap<String, Session>>,
    favorites: Mutex<Vec<FavoriteEntry>>,
    fail_auth: AtomicBool,
    fail_sign_out: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    inserts: AtomicUsize,
    deletes: AtomicUsize,
    insert_gate: Gate,
    fetch_gates: Mutex<HashMap<Uuid, Arc<Gate>>>,
    session_ttl: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account directly, bypassing the password policy.
    pub fn register(&self, email: &str, password: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
        };
        self.accounts
            .lock()
            .insert(email.to_string(), (user.clone(), password.to_string()));
        user
    }

    /// Stores a favorite without going through a store.
    pub fn seed_favorite(&self, user: &User, book: &RawRecord) {
        let snapshot = normalize(book);
        self.favorites.lock().push(FavoriteEntry {
            user_id: user.id,
            book_id: snapshot.id().to_string(),
            snapshot,
            created_at: Utc::now(),
        });
    }

    pub fn stored_favorites(&self, user_id: Uuid) -> Vec<FavoriteEntry> {
        self.favorites
            .lock()
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of inserts that reached the table.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Number of deletes that reached the table.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Lifetime of sessions issued from now on; negative values issue expired ones.
    pub fn issue_sessions_lasting(&self, ttl: Duration) {
        *self.session_ttl.lock() = Some(ttl);
    }

    /// Makes an issued session expire right away.
    pub fn expire_session(&self, token: &str) {
        if let Some(session) = self.sessions.lock().get_mut(token) {
            session.expires_at = Utc::now() - Duration::seconds(1);
        }
    }

    pub fn pause_inserts(&self) {
        self.insert_gate.close();
    }

    pub fn resume_inserts(&self) {
        self.insert_gate.open();
    }

    pub fn pause_fetches_for(&self, user_id: Uuid) {
        let gate = Arc::new(Gate::default());
        gate.close();
        self.fetch_gates.lock().insert(user_id, gate);
    }

    pub fn resume_fetches_for(&self, user_id: Uuid) {
        if let Some(gate) = self.fetch_gates.lock().remove(&user_id) {
            gate.open();
        }
    }

    fn open_session(&self, user: User) -> Session {
        let session = Session {
            token: Uuid::new_v4().to_string(),
            user,
            expires_at: Utc::now() + self.session_ttl.lock().unwrap_or_else(|| Duration::days(30)),
        };
        self.sessions
            .lock()
            .insert(session.token.clone(), session.clone());
        session
    }

    fn check_auth_reachable(&self) -> AuthResult<()> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(AuthError::Network("auth backend offline".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> PersistenceResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed("table is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.check_auth_reachable()?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        if self.accounts.lock().contains_key(email) {
            return Err(AuthError::EmailTaken);
        }
        let user = self.register(email, password);
        Ok(self.open_session(user))
    }

    async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Session> {
        self.check_auth_reachable()?;
        let user = match self.accounts.lock().get(email) {
            Some((user, stored)) if stored == password => user.clone(),
            _ => return Err(AuthError::InvalidCredentials),
        };
        Ok(self.open_session(user))
    }

    async fn sign_out(&self, token: &str) -> AuthResult<()> {
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(AuthError::Network("sign out request dropped".to_string()));
        }
        self.sessions.lock().remove(token);
        Ok(())
    }

    async fn resolve_session(&self, token: &str) -> AuthResult<Option<Session>> {
        self.check_auth_reachable()?;
        Ok(self
            .sessions
            .lock()
            .get(token)
            .filter(|session| !session.is_expired_at(Utc::now()))
            .cloned())
    }
}

#[async_trait]
impl FavoritesRepository for MemoryBackend {
    async fn select_by_user(&self, user_id: Uuid) -> PersistenceResult<Vec<FavoriteEntry>> {
        let gate = self.fetch_gates.lock().get(&user_id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PersistenceError::ReadFailed("table unavailable".to_string()));
        }
        Ok(self.stored_favorites(user_id))
    }

    async fn insert(&self, entry: &FavoriteEntry) -> PersistenceResult<()> {
        self.insert_gate.pass().await;
        self.check_writable()?;
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let mut favorites = self.favorites.lock();
        let exists = favorites
            .iter()
            .any(|e| e.user_id == entry.user_id && e.book_id == entry.book_id);
        if !exists {
            favorites.push(entry.clone());
        }
        Ok(())
    }

    async fn delete(&self, user_id: Uuid, book_id: &str) -> PersistenceResult<()> {
        self.check_writable()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.favorites
            .lock()
            .retain(|e| !(e.user_id == user_id && e.book_id == book_id));
        Ok(())
    }
}
