//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and the per-browser contexts.
//!
//! Every session cookie gets its own `BrowsingContext`: a session provider, a
//! favorites store observing it and a guard in front of it. A context is kept
//! while its session is signed in and in use; it is re-checked against the
//! backend periodically and dropped once expired, revoked or idle.

use crate::config::Config;
use book_finder_core::{
    AccessGuard, AuthBackend, CatalogGateway, FavoritesRepository, FavoritesStore, SessionProvider,
    SessionState,
};
use book_finder_core::guard::DEFAULT_HOME_PATH;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<dyn AuthBackend>,
    pub favorites_repo: Arc<dyn FavoritesRepository>,
    pub catalog: CatalogGateway,
    pub config: Arc<Config>,
    pub contexts: ContextRegistry,
}

impl AppState {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        favorites_repo: Arc<dyn FavoritesRepository>,
        catalog: CatalogGateway,
        config: Arc<Config>,
    ) -> Self {
        Self {
            auth,
            favorites_repo,
            catalog,
            config,
            contexts: ContextRegistry::default(),
        }
    }

    /// A fresh context that has not resolved anything yet.
    pub fn new_context(&self, token: Option<String>) -> Arc<BrowsingContext> {
        Arc::new(BrowsingContext::new(
            self.auth.clone(),
            self.favorites_repo.clone(),
            &self.config.sign_in_path,
            token,
        ))
    }

    /// Returns the context for `token`, creating one and starting its restore
    /// if this token has not been seen yet.
    pub fn context_for(&self, token: &str) -> Arc<BrowsingContext> {
        let (context, created) = self
            .contexts
            .get_or_insert_with(token, || self.new_context(Some(token.to_string())));
        if created {
            let registry = self.contexts.clone();
            let restoring = context.clone();
            let token = token.to_string();
            tokio::spawn(async move {
                restoring.session.restore_session().await;
                if restoring.session.state() == SessionState::Absent {
                    debug!("Dropping context for an unrecognized session cookie");
                    registry.remove_if_same(&token, &restoring);
                }
            });
        }
        context
    }

    /// Like [`AppState::context_for`], but first makes sure a signed-in session
    /// is still good. Expired sessions are checked on every call, revocation
    /// once per revalidation interval. A context whose session ended is
    /// evicted and comes back reporting `Absent`.
    pub async fn active_context(&self, token: &str) -> Arc<BrowsingContext> {
        let context = self.context_for(token);
        context.touch();

        let expired = context
            .session
            .state()
            .session()
            .is_some_and(|session| session.is_expired_at(Utc::now()));
        if expired || context.revalidation_due(self.config.session_revalidate_interval) {
            let state = context.session.revalidate().await;
            context.mark_validated();
            if state == SessionState::Absent {
                debug!("Evicting context whose session ended");
                self.contexts.remove_if_same(token, &context);
            }
        }
        context
    }
}

//=========================================================================================
// BrowsingContext (Specific to One Session Cookie)
//=========================================================================================

pub struct BrowsingContext {
    pub session: Arc<SessionProvider>,
    pub favorites: FavoritesStore,
    pub guard: AccessGuard,
    last_seen: Mutex<Instant>,
    last_validated: Mutex<Instant>,
}

impl BrowsingContext {
    /// Wires a favorites store to a new session provider.
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        favorites_repo: Arc<dyn FavoritesRepository>,
        sign_in_path: &str,
        token: Option<String>,
    ) -> Self {
        let session = Arc::new(SessionProvider::with_persisted_token(auth, token));
        let favorites = FavoritesStore::new(favorites_repo);
        session.add_observer(Arc::new(favorites.clone()));
        let guard = AccessGuard::new(session.clone()).with_paths(sign_in_path, DEFAULT_HOME_PATH);
        let now = Instant::now();
        Self {
            session,
            favorites,
            guard,
            last_seen: Mutex::new(now),
            last_validated: Mutex::new(now),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn revalidation_due(&self, interval: Duration) -> bool {
        self.last_validated.lock().elapsed() >= interval
    }

    fn mark_validated(&self) {
        *self.last_validated.lock() = Instant::now();
    }
}

//=========================================================================================
// ContextRegistry
//=========================================================================================

/// Browsing contexts keyed by session token.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<BrowsingContext>>>>,
}

impl ContextRegistry {
    pub fn get(&self, token: &str) -> Option<Arc<BrowsingContext>> {
        self.inner.read().get(token).cloned()
    }

    pub fn insert(&self, token: String, context: Arc<BrowsingContext>) {
        self.inner.write().insert(token, context);
    }

    pub fn remove(&self, token: &str) -> Option<Arc<BrowsingContext>> {
        self.inner.write().remove(token)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Returns the existing context or inserts a new one. The flag is true when
    /// `create` was called.
    fn get_or_insert_with(
        &self,
        token: &str,
        create: impl FnOnce() -> Arc<BrowsingContext>,
    ) -> (Arc<BrowsingContext>, bool) {
        if let Some(existing) = self.get(token) {
            return (existing, false);
        }
        let mut map = self.inner.write();
        if let Some(existing) = map.get(token) {
            return (existing.clone(), false);
        }
        let context = create();
        map.insert(token.to_string(), context.clone());
        (context, true)
    }

    /// Drops every context unused for at least `max_idle`. Returns how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, context| context.idle_for() < max_idle);
        before - map.len()
    }

    /// Runs [`ContextRegistry::evict_idle`] on a fixed period in the background.
    pub fn spawn_idle_eviction(&self, max_idle: Duration, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(max_idle);
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "Evicted idle browsing contexts");
                }
            }
        })
    }

    /// Removes the entry only if it still points at `context`.
    fn remove_if_same(&self, token: &str, context: &Arc<BrowsingContext>) {
        let mut map = self.inner.write();
        if map.get(token).is_some_and(|current| Arc::ptr_eq(current, context)) {
            map.remove(token);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use book_finder_core::ports::CatalogProvider;
    use book_finder_core::testing::MemoryBackend;
    use book_finder_core::{RawRecord, SearchOptions, UpstreamError};
    use async_trait::async_trait;
    use serde_json::json;

    /// A catalog with one book and one subject.
    pub(crate) struct FixedCatalog;

    #[async_trait]
    impl CatalogProvider for FixedCatalog {
        async fn search(
            &self,
            _query: &str,
            _options: SearchOptions,
        ) -> Result<Vec<RawRecord>, UpstreamError> {
            Ok(vec![json!({ "key": "/works/OL123W", "title": "Dune", "author_name": ["Frank Herbert"] })])
        }

        async fn fetch_by_id(&self, id: &str) -> Result<RawRecord, UpstreamError> {
            if id == "OL123W" {
                Ok(json!({ "key": "/works/OL123W", "title": "Dune" }))
            } else {
                Err(UpstreamError::NotFound(id.to_string()))
            }
        }

        async fn fetch_subject(
            &self,
            _subject: &str,
            _options: SearchOptions,
        ) -> Result<Vec<RawRecord>, UpstreamError> {
            Ok(vec![json!({ "key": "/works/OL9W", "title": "Emma", "authors": [{ "name": "Jane Austen" }] })])
        }
    }

    pub(crate) fn test_config() -> Config {
        Config::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/books".to_string()),
            "SESSION_RESOLVE_WAIT_MS" => Some("500".to_string()),
            _ => None,
        })
        .unwrap()
    }

    pub(crate) fn test_state() -> (Arc<AppState>, Arc<MemoryBackend>) {
        test_state_with(test_config())
    }

    pub(crate) fn test_state_with(config: Config) -> (Arc<AppState>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.register("reader@example.com", "secret123");
        let state = AppState::new(
            backend.clone(),
            backend.clone(),
            CatalogGateway::new(Arc::new(FixedCatalog)),
            Arc::new(config),
        );
        (Arc::new(state), backend)
    }

    /// A config that re-checks the session with the backend on every request.
    pub(crate) fn eager_revalidation_config() -> Config {
        Config {
            session_revalidate_interval: Duration::ZERO,
            ..test_config()
        }
    }

    /// Signs in through a fresh context and files it under the new token.
    pub(crate) async fn signed_in_context(state: &AppState) -> (Arc<BrowsingContext>, String) {
        let context = state.new_context(None);
        let session = context
            .session
            .sign_in("reader@example.com", "secret123")
            .await
            .unwrap();
        state.contexts.insert(session.token.clone(), context.clone());
        (context, session.token)
    }

    #[tokio::test]
    async fn test_unknown_token_context_is_dropped_after_restore() {
        let (state, _backend) = test_state();
        let context = state.context_for("bogus");
        assert_eq!(state.contexts.len(), 1);

        let resolved = context.session.wait_resolved(Duration::from_secs(1)).await;
        assert_eq!(resolved, SessionState::Absent);
        for _ in 0..50 {
            if state.contexts.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(state.contexts.is_empty());
    }

    #[tokio::test]
    async fn test_valid_token_context_is_reused() {
        let (state, backend) = test_state();
        let session = backend.sign_in("reader@example.com", "secret123").await.unwrap();

        let first = state.context_for(&session.token);
        let resolved = first.session.wait_resolved(Duration::from_secs(1)).await;
        assert_eq!(resolved.user().map(|u| u.id), Some(session.user.id));

        let second = state.context_for(&session.token);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(state.contexts.len(), 1);
    }

    #[tokio::test]
    async fn test_active_context_evicts_revoked_session() {
        let (state, backend) = test_state_with(eager_revalidation_config());
        let (context, token) = signed_in_context(&state).await;
        backend.sign_out(&token).await.unwrap();

        let active = state.active_context(&token).await;
        assert!(Arc::ptr_eq(&active, &context));
        assert_eq!(active.session.state(), SessionState::Absent);
        assert!(state.contexts.is_empty());
    }

    #[tokio::test]
    async fn test_active_context_keeps_session_between_revalidations() {
        let (state, backend) = test_state();
        let (context, token) = signed_in_context(&state).await;
        backend.sign_out(&token).await.unwrap();

        // The default interval has not elapsed, so the revocation is not seen yet.
        let active = state.active_context(&token).await;
        assert!(Arc::ptr_eq(&active, &context));
        assert!(active.session.state().session().is_some());
        assert_eq!(state.contexts.len(), 1);
    }

    #[tokio::test]
    async fn test_active_context_evicts_expired_session() {
        let (state, backend) = test_state();
        backend.issue_sessions_lasting(chrono::Duration::seconds(-1));
        let (_context, token) = signed_in_context(&state).await;

        let active = state.active_context(&token).await;
        assert_eq!(active.session.state(), SessionState::Absent);
        assert!(state.contexts.is_empty());
        assert!(backend.resolve_session(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_idle_drops_unused_contexts() {
        let (state, _backend) = test_state();
        let (_context, token) = signed_in_context(&state).await;

        assert_eq!(state.contexts.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(state.contexts.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.contexts.evict_idle(Duration::from_millis(10)), 1);
        assert!(state.contexts.get(&token).is_none());
    }

    #[tokio::test]
    async fn test_idle_eviction_task_sweeps_registry() {
        let (state, _backend) = test_state();
        signed_in_context(&state).await;

        let task = state
            .contexts
            .spawn_idle_eviction(Duration::from_millis(10), Duration::from_millis(5));
        for _ in 0..50 {
            if state.contexts.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        assert!(state.contexts.is_empty());
    }
}
