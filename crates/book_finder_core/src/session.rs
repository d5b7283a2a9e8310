//! crates/book_finder_core/src/session.rs
//!
//! The session provider owns the authentication lifecycle of one browsing
//! instance: restore, sign up, sign in and sign out.
//!
//! Every state transition is delivered to each registered [`SessionObserver`]
//! exactly once, in the order the transitions happened. Transitions are
//! serialized by a lock that is held while observers run, so an observer must
//! never call back into the provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{Session, SessionState, User};
use crate::ports::{AuthBackend, AuthError, AuthResult};

/// Minimum password length accepted by `sign_up`.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Receives session transitions synchronously.
pub trait SessionObserver: Send + Sync {
    fn on_session_changed(&self, state: &SessionState);
}

pub struct SessionProvider {
    backend: Arc<dyn AuthBackend>,
    persisted_token: Mutex<Option<String>>,
    state_tx: watch::Sender<SessionState>,
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
    transition_lock: Mutex<()>,
}

impl SessionProvider {
    /// Creates a provider with nothing persisted; `restore_session` resolves to `Absent`.
    pub fn new(backend: Arc<dyn AuthBackend>) -> Self {
        Self::with_persisted_token(backend, None)
    }

    /// Creates a provider that will try to restore `token` on startup.
    pub fn with_persisted_token(backend: Arc<dyn AuthBackend>, token: Option<String>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unknown);
        Self {
            backend,
            persisted_token: Mutex::new(token),
            state_tx,
            observers: Mutex::new(Vec::new()),
            transition_lock: Mutex::new(()),
        }
    }

    /// Registers an observer and immediately replays the current state to it.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        let _transition = self.transition_lock.lock();
        let current = self.state();
        observer.on_session_changed(&current);
        self.observers.lock().push(observer);
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state_tx.borrow().user().cloned()
    }

    /// The token that would be restored on the next start, if any.
    pub fn persisted_token(&self) -> Option<String> {
        self.persisted_token.lock().clone()
    }

    /// A receiver that always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Waits up to `limit` for the state to leave `Unknown` and returns whatever it is then.
    pub async fn wait_resolved(&self, limit: Duration) -> SessionState {
        let mut rx = self.state_tx.subscribe();
        // A timeout or a closed channel both leave us with the current value.
        let _ = tokio::time::timeout(limit, rx.wait_for(SessionState::is_resolved)).await;
        self.state()
    }

    /// Resolves the startup state from the persisted token.
    ///
    /// Only acts while the state is still `Unknown`; a sign-in that finished
    /// first wins. Backend failures resolve to `Absent`.
    pub async fn restore_session(&self) {
        if self.state_tx.borrow().is_resolved() {
            return;
        }

        let token = self.persisted_token.lock().clone();
        let resolved = match token {
            None => {
                debug!("No persisted session token");
                SessionState::Absent
            }
            Some(token) => match self.backend.resolve_session(&token).await {
                Ok(Some(session)) if session.is_expired_at(Utc::now()) => {
                    info!("Persisted session has expired");
                    self.persisted_token.lock().take();
                    SessionState::Absent
                }
                Ok(Some(session)) => {
                    info!(user_id = %session.user.id, "Session restored");
                    SessionState::Authenticated(session)
                }
                Ok(None) => {
                    info!("Persisted session is no longer valid");
                    self.persisted_token.lock().take();
                    SessionState::Absent
                }
                Err(e) => {
                    warn!(error = %e, "Session restore failed, treating as signed out");
                    SessionState::Absent
                }
            },
        };

        self.transition_from_unknown(resolved);
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<Session> {
        let session = self.backend.sign_in(email, password).await.map_err(|e| {
            warn!(error = %e, "Sign in failed");
            e
        })?;
        info!(user_id = %session.user.id, "Signed in");
        self.accept(session.clone());
        Ok(session)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> AuthResult<Session> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let session = self.backend.sign_up(email, password).await.map_err(|e| {
            warn!(error = %e, "Sign up failed");
            e
        })?;
        info!(user_id = %session.user.id, "Signed up");
        self.accept(session.clone());
        Ok(session)
    }

    /// Signs out. Local state is cleared first and unconditionally; a failure
    /// of the remote call is still returned to the caller.
    ///
    /// While a restore is still in flight there is no session yet, so the
    /// persisted token is the one revoked.
    pub async fn sign_out(&self) -> AuthResult<()> {
        let session_token = self
            .state_tx
            .borrow()
            .session()
            .map(|session| session.token.clone());
        let persisted = self.persisted_token.lock().take();
        let token = session_token.or(persisted);
        self.transition(SessionState::Absent);

        let Some(token) = token else {
            return Ok(());
        };
        self.backend.sign_out(&token).await.map_err(|e| {
            warn!(error = %e, "Remote sign out failed; local session already cleared");
            e
        })
    }

    /// Checks a signed-in session against the clock and then the backend.
    ///
    /// An expired session is cleared locally and revoked remotely. A token the
    /// backend no longer recognizes resolves to `Absent`. A backend failure
    /// keeps the current state. Returns the state afterwards.
    pub async fn revalidate(&self) -> SessionState {
        let current = self.state();
        let Some(session) = current.session().cloned() else {
            return current;
        };

        if session.is_expired_at(Utc::now()) {
            info!(user_id = %session.user.id, "Session expired");
            self.replace_session(&session.token, SessionState::Absent);
            if let Err(e) = self.backend.sign_out(&session.token).await {
                warn!(error = %e, "Could not revoke expired session");
            }
            return self.state();
        }

        match self.backend.resolve_session(&session.token).await {
            Ok(Some(current)) if !current.is_expired_at(Utc::now()) => {
                self.replace_session(&session.token, SessionState::Authenticated(current));
            }
            Ok(_) => {
                info!(user_id = %session.user.id, "Session no longer valid on the backend");
                self.replace_session(&session.token, SessionState::Absent);
            }
            Err(e) => {
                warn!(error = %e, "Session revalidation failed, keeping current state");
            }
        }
        self.state()
    }

    fn accept(&self, session: Session) {
        *self.persisted_token.lock() = Some(session.token.clone());
        self.transition(SessionState::Authenticated(session));
    }

    fn transition_from_unknown(&self, next: SessionState) {
        let _transition = self.transition_lock.lock();
        if self.state_tx.borrow().is_resolved() {
            return;
        }
        self.apply(next);
    }

    /// Applies `next` only if `token` is still the signed-in session.
    fn replace_session(&self, token: &str, next: SessionState) {
        let _transition = self.transition_lock.lock();
        let still_current = self
            .state_tx
            .borrow()
            .session()
            .is_some_and(|session| session.token == token);
        if !still_current {
            return;
        }
        if !matches!(next, SessionState::Authenticated(_)) {
            self.persisted_token.lock().take();
        }
        self.apply(next);
    }

    fn transition(&self, next: SessionState) {
        let _transition = self.transition_lock.lock();
        self.apply(next);
    }

    /// Must be called with `transition_lock` held.
    fn apply(&self, next: SessionState) {
        if *self.state_tx.borrow() == next {
            return;
        }
        self.state_tx.send_replace(next.clone());

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_session_changed(&next);
        }
    }
}
