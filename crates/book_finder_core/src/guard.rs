//! crates/book_finder_core/src/guard.rs
//!
//! Gates views on the session state. While the session is still `Unknown`
//! the guard only ever answers `Loading`, so nobody is redirected before the
//! session had a chance to resolve.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Session, SessionState};
use crate::session::SessionProvider;

pub const DEFAULT_SIGN_IN_PATH: &str = "/login";
pub const DEFAULT_HOME_PATH: &str = "/";

/// What a view needs from the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Someone must be signed in (favorites pages).
    Authenticated,
    /// Nobody may be signed in (sign-in and sign-up pages).
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<V> {
    Loading,
    Redirect(String),
    View(V),
}

pub struct AccessGuard {
    session: Arc<SessionProvider>,
    sign_in_path: String,
    home_path: String,
}

impl AccessGuard {
    pub fn new(session: Arc<SessionProvider>) -> Self {
        Self {
            session,
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            home_path: DEFAULT_HOME_PATH.to_string(),
        }
    }

    pub fn with_paths(mut self, sign_in_path: impl Into<String>, home_path: impl Into<String>) -> Self {
        self.sign_in_path = sign_in_path.into();
        self.home_path = home_path.into();
        self
    }

    /// Decides against the current state without waiting.
    pub fn guard<V>(&self, requirement: Requirement, view: impl FnOnce(Option<&Session>) -> V) -> Guarded<V> {
        self.decide(&self.session.state(), requirement, view)
    }

    /// Like [`AccessGuard::guard`], but first gives an unresolved session up to `wait` to settle.
    pub async fn guard_resolved<V>(
        &self,
        requirement: Requirement,
        wait: Duration,
        view: impl FnOnce(Option<&Session>) -> V,
    ) -> Guarded<V> {
        let state = self.session.wait_resolved(wait).await;
        self.decide(&state, requirement, view)
    }

    fn decide<V>(
        &self,
        state: &SessionState,
        requirement: Requirement,
        view: impl FnOnce(Option<&Session>) -> V,
    ) -> Guarded<V> {
        match (state, requirement) {
            (SessionState::Unknown, _) => Guarded::Loading,
            (SessionState::Absent, Requirement::Authenticated) => {
                Guarded::Redirect(self.sign_in_path.clone())
            }
            (SessionState::Authenticated(_), Requirement::Anonymous) => {
                Guarded::Redirect(self.home_path.clone())
            }
            (state, _) => Guarded::View(view(state.session())),
        }
    }
}
