//! crates/book_finder_core/src/favorites.rs
//!
//! The favorites store: the current user's saved books, kept in sync with the
//! remote `FavoritesRepository`.
//!
//! Lifecycle per session: `Empty` (nobody signed in) → `Loading` → `Loaded`.
//! Adds and removes are applied locally first, written through, and rolled
//! back if the write fails. Mutations of the same book are serialized by a
//! per-book async lock; reads never wait on them.
//!
//! Two counters guard against late results:
//! - `epoch` changes whenever the signed-in identity changes. A mutation that
//!   settles in a different epoch leaves the collection alone.
//! - `load_seq` changes whenever a load starts. A load result is applied only
//!   if its sequence number and target user are still current.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::normalize;
use crate::domain::{CanonicalBook, FavoriteEntry, RawRecord, SessionState, User};
use crate::ports::{FavoritesRepository, PersistenceError, PersistenceResult};
use crate::session::SessionObserver;

const EVENT_CAPACITY: usize = 64;

//=========================================================================================
// Public Types
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FavoritesError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("No user is signed in")]
    NoActiveUser,
    #[error("User {0} is not the signed-in user")]
    UserMismatch(Uuid),
}

pub type FavoritesResult<T> = Result<T, FavoritesError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoritesPhase {
    Empty,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Remove,
}

/// Where an optimistic mutation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub book_id: String,
    pub state: MutationState,
}

/// Everything the store broadcasts, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum FavoritesEvent {
    Cleared,
    Loading { user_id: Uuid },
    Loaded {
        user_id: Uuid,
        count: usize,
        error: Option<PersistenceError>,
    },
    StaleLoadDiscarded { user_id: Uuid },
    Mutation(Mutation),
}

/// A read-only copy of the store's state.
#[derive(Debug, Clone, PartialEq)]
pub struct FavoritesSnapshot {
    pub user_id: Option<Uuid>,
    pub phase: FavoritesPhase,
    pub entries: Vec<FavoriteEntry>,
    /// Set when the last load failed; the collection is then empty.
    pub last_error: Option<PersistenceError>,
    /// Books with a mutation in flight.
    pub pending: Vec<String>,
}

//=========================================================================================
// Collection
//=========================================================================================

/// Insertion-ordered entries keyed by book id.
#[derive(Default)]
struct Collection {
    entries: HashMap<String, FavoriteEntry>,
    order: Vec<String>,
}

impl Collection {
    fn from_entries(entries: impl IntoIterator<Item = FavoriteEntry>) -> Self {
        let mut collection = Self::default();
        for entry in entries {
            collection.push(entry);
        }
        collection
    }

    fn contains(&self, book_id: &str) -> bool {
        self.entries.contains_key(book_id)
    }

    fn get(&self, book_id: &str) -> Option<&FavoriteEntry> {
        self.entries.get(book_id)
    }

    /// Appends unless the book is already present.
    fn push(&mut self, entry: FavoriteEntry) -> bool {
        if self.contains(&entry.book_id) {
            return false;
        }
        self.order.push(entry.book_id.clone());
        self.entries.insert(entry.book_id.clone(), entry);
        true
    }

    fn remove(&mut self, book_id: &str) -> Option<(usize, FavoriteEntry)> {
        let entry = self.entries.remove(book_id)?;
        let position = self.order.iter().position(|id| id == book_id)?;
        self.order.remove(position);
        Some((position, entry))
    }

    fn restore(&mut self, position: usize, entry: FavoriteEntry) {
        if self.contains(&entry.book_id) {
            return;
        }
        let position = position.min(self.order.len());
        self.order.insert(position, entry.book_id.clone());
        self.entries.insert(entry.book_id.clone(), entry);
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn to_vec(&self) -> Vec<FavoriteEntry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

//=========================================================================================
// Store
//=========================================================================================

struct StoreState {
    user_id: Option<Uuid>,
    epoch: u64,
    load_seq: u64,
    phase: FavoritesPhase,
    collection: Collection,
    last_error: Option<PersistenceError>,
    pending: HashSet<String>,
}

struct Inner {
    repo: Arc<dyn FavoritesRepository>,
    state: Mutex<StoreState>,
    book_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<FavoritesEvent>,
    phase_tx: watch::Sender<FavoritesPhase>,
}

/// The favorites store for one browsing instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FavoritesStore {
    inner: Arc<Inner>,
}

impl FavoritesStore {
    pub fn new(repo: Arc<dyn FavoritesRepository>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (phase_tx, _) = watch::channel(FavoritesPhase::Empty);
        Self {
            inner: Arc::new(Inner {
                repo,
                state: Mutex::new(StoreState {
                    user_id: None,
                    epoch: 0,
                    load_seq: 0,
                    phase: FavoritesPhase::Empty,
                    collection: Collection::default(),
                    last_error: None,
                    pending: HashSet::new(),
                }),
                book_locks: Mutex::new(HashMap::new()),
                events,
                phase_tx,
            }),
        }
    }

    //-------------------------------------------------------------------------------------
    // Reads
    //-------------------------------------------------------------------------------------

    pub fn is_favorite(&self, book_id: &str) -> bool {
        self.inner.state.lock().collection.contains(book_id)
    }

    pub fn get(&self, book_id: &str) -> Option<FavoriteEntry> {
        self.inner.state.lock().collection.get(book_id).cloned()
    }

    /// Whether an add or remove of this book is still waiting on the remote store.
    pub fn is_mutating(&self, book_id: &str) -> bool {
        self.inner.state.lock().pending.contains(book_id)
    }

    pub fn phase(&self) -> FavoritesPhase {
        self.inner.state.lock().phase
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<FavoriteEntry> {
        self.inner.state.lock().collection.to_vec()
    }

    pub fn snapshot(&self) -> FavoritesSnapshot {
        let state = self.inner.state.lock();
        let mut pending: Vec<String> = state.pending.iter().cloned().collect();
        pending.sort();
        FavoritesSnapshot {
            user_id: state.user_id,
            phase: state.phase,
            entries: state.collection.to_vec(),
            last_error: state.last_error.clone(),
            pending,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FavoritesEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the store is not `Loading`.
    pub async fn settled(&self) -> FavoritesPhase {
        let mut rx = self.inner.phase_tx.subscribe();
        // The sender lives as long as `self`, so this only ends on a match.
        let _ = rx
            .wait_for(|phase| *phase != FavoritesPhase::Loading)
            .await;
        self.phase()
    }

    //-------------------------------------------------------------------------------------
    // Identity changes and loading
    //-------------------------------------------------------------------------------------

    /// Reacts to a new signed-in identity and, if it changed, loads its favorites.
    pub async fn on_user_changed(&self, user: Option<&User>) {
        if let Some((load_seq, user_id)) = self.begin_user_change(user) {
            self.load(load_seq, user_id).await;
        }
    }

    /// Reads every entry stored for `user_id`.
    pub async fn fetch_all(&self, user_id: Uuid) -> PersistenceResult<Vec<FavoriteEntry>> {
        let entries = self.inner.repo.select_by_user(user_id).await?;
        let total = entries.len();
        let owned: Vec<FavoriteEntry> = entries
            .into_iter()
            .filter(|entry| entry.user_id == user_id)
            .collect();
        if owned.len() != total {
            warn!(%user_id, dropped = total - owned.len(), "Repository returned rows for another user");
        }
        Ok(owned)
    }

    /// Loads again for the current user, keeping what is shown until the result arrives.
    pub async fn reload(&self) {
        let next = {
            let mut state = self.inner.state.lock();
            let Some(user_id) = state.user_id else {
                return;
            };
            state.load_seq += 1;
            state.last_error = None;
            self.set_phase(&mut state, FavoritesPhase::Loading);
            self.emit(FavoritesEvent::Loading { user_id });
            (state.load_seq, user_id)
        };
        self.load(next.0, next.1).await;
    }

    /// The synchronous half of a user change. Returns the load to run, if any.
    fn begin_user_change(&self, user: Option<&User>) -> Option<(u64, Uuid)> {
        let mut state = self.inner.state.lock();
        let next = user.map(|u| u.id);
        if state.user_id == next {
            return None;
        }

        state.user_id = next;
        state.epoch += 1;
        state.load_seq += 1;
        state.collection = Collection::default();
        state.pending.clear();
        state.last_error = None;

        match next {
            None => {
                debug!("Favorites cleared");
                self.set_phase(&mut state, FavoritesPhase::Empty);
                self.emit(FavoritesEvent::Cleared);
                None
            }
            Some(user_id) => {
                debug!(%user_id, "Loading favorites");
                self.set_phase(&mut state, FavoritesPhase::Loading);
                self.emit(FavoritesEvent::Loading { user_id });
                Some((state.load_seq, user_id))
            }
        }
    }

    async fn load(&self, load_seq: u64, user_id: Uuid) {
        let result = self.fetch_all(user_id).await;

        let mut state = self.inner.state.lock();
        if state.load_seq != load_seq || state.user_id != Some(user_id) {
            debug!(%user_id, "Discarding stale favorites response");
            self.emit(FavoritesEvent::StaleLoadDiscarded { user_id });
            return;
        }

        let error = match result {
            Ok(entries) => {
                let mut loaded = Collection::from_entries(entries);
                // Mutations still in flight keep their local outcome.
                let pending: Vec<String> = state.pending.iter().cloned().collect();
                for book_id in pending {
                    match state.collection.get(&book_id) {
                        Some(local) => {
                            loaded.push(local.clone());
                        }
                        None => {
                            loaded.remove(&book_id);
                        }
                    }
                }
                state.collection = loaded;
                state.last_error = None;
                info!(%user_id, count = state.collection.len(), "Favorites loaded");
                None
            }
            Err(e) => {
                warn!(%user_id, error = %e, "Failed to load favorites");
                state.collection = Collection::default();
                state.last_error = Some(e.clone());
                Some(e)
            }
        };

        let count = state.collection.len();
        self.set_phase(&mut state, FavoritesPhase::Loaded);
        self.emit(FavoritesEvent::Loaded {
            user_id,
            count,
            error,
        });
    }

    //-------------------------------------------------------------------------------------
    // Mutations
    //-------------------------------------------------------------------------------------

    /// Saves `book` for `user_id`. Already-saved books succeed without a remote write.
    pub async fn add(&self, user_id: Uuid, book: &RawRecord) -> FavoritesResult<()> {
        let snapshot = normalize(book);
        self.ensure_current(user_id)?;

        let book_id = snapshot.id().to_string();
        let lock = self.book_lock(&book_id);
        let result = {
            let _serialized = lock.lock().await;
            self.add_locked(user_id, snapshot).await
        };
        self.release_book_lock(&book_id, lock);
        result
    }

    /// Removes `book_id` for `user_id`. Removing a book that is not saved is a no-op.
    pub async fn remove(&self, user_id: Uuid, book_id: &str) -> FavoritesResult<()> {
        self.ensure_current(user_id)?;

        let lock = self.book_lock(book_id);
        let result = {
            let _serialized = lock.lock().await;
            self.remove_locked(user_id, book_id).await
        };
        self.release_book_lock(book_id, lock);
        result
    }

    async fn add_locked(&self, user_id: Uuid, snapshot: CanonicalBook) -> FavoritesResult<()> {
        let book_id = snapshot.id().to_string();
        let (epoch, entry) = {
            let mut state = self.inner.state.lock();
            let epoch = Self::check_current(&state, user_id)?;
            if state.collection.contains(&book_id) {
                debug!(%user_id, book_id = %book_id, "Book already in favorites");
                return Ok(());
            }
            let entry = FavoriteEntry {
                user_id,
                book_id: book_id.clone(),
                snapshot,
                created_at: Utc::now(),
            };
            state.collection.push(entry.clone());
            state.pending.insert(book_id.clone());
            self.emit_mutation(MutationKind::Add, &book_id, MutationState::Pending);
            (epoch, entry)
        };

        let result = self.inner.repo.insert(&entry).await;

        let mut state = self.inner.state.lock();
        let same_epoch = state.epoch == epoch;
        if same_epoch {
            state.pending.remove(&book_id);
        }
        match result {
            Ok(()) => {
                info!(%user_id, book_id = %book_id, "Favorite added");
                self.emit_mutation(MutationKind::Add, &book_id, MutationState::Committed);
                Ok(())
            }
            Err(e) => {
                warn!(%user_id, book_id = %book_id, error = %e, "Favorite add failed, rolling back");
                if same_epoch {
                    state.collection.remove(&book_id);
                }
                self.emit_mutation(MutationKind::Add, &book_id, MutationState::RolledBack);
                Err(e.into())
            }
        }
    }

    async fn remove_locked(&self, user_id: Uuid, book_id: &str) -> FavoritesResult<()> {
        let (epoch, removed) = {
            let mut state = self.inner.state.lock();
            let epoch = Self::check_current(&state, user_id)?;
            let Some(removed) = state.collection.remove(book_id) else {
                debug!(%user_id, book_id, "Book not in favorites");
                return Ok(());
            };
            state.pending.insert(book_id.to_string());
            self.emit_mutation(MutationKind::Remove, book_id, MutationState::Pending);
            (epoch, removed)
        };

        let result = self.inner.repo.delete(user_id, book_id).await;

        let mut state = self.inner.state.lock();
        let same_epoch = state.epoch == epoch;
        if same_epoch {
            state.pending.remove(book_id);
        }
        match result {
            Ok(()) => {
                info!(%user_id, book_id, "Favorite removed");
                self.emit_mutation(MutationKind::Remove, book_id, MutationState::Committed);
                Ok(())
            }
            Err(e) => {
                warn!(%user_id, book_id, error = %e, "Favorite remove failed, restoring");
                if same_epoch {
                    let (position, entry) = removed;
                    state.collection.restore(position, entry);
                }
                self.emit_mutation(MutationKind::Remove, book_id, MutationState::RolledBack);
                Err(e.into())
            }
        }
    }

    //-------------------------------------------------------------------------------------
    // Helpers
    //-------------------------------------------------------------------------------------

    fn ensure_current(&self, user_id: Uuid) -> FavoritesResult<u64> {
        let state = self.inner.state.lock();
        Self::check_current(&state, user_id)
    }

    fn check_current(state: &StoreState, user_id: Uuid) -> FavoritesResult<u64> {
        match state.user_id {
            None => Err(FavoritesError::NoActiveUser),
            Some(current) if current != user_id => Err(FavoritesError::UserMismatch(user_id)),
            Some(_) => Ok(state.epoch),
        }
    }

    fn book_lock(&self, book_id: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .book_locks
            .lock()
            .entry(book_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the per-book lock once nobody else is holding or waiting on it.
    fn release_book_lock(&self, book_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.inner.book_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(book_id);
        }
    }

    fn set_phase(&self, state: &mut StoreState, phase: FavoritesPhase) {
        state.phase = phase;
        self.inner.phase_tx.send_replace(phase);
    }

    fn emit(&self, event: FavoritesEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_mutation(&self, kind: MutationKind, book_id: &str, state: MutationState) {
        self.emit(FavoritesEvent::Mutation(Mutation {
            kind,
            book_id: book_id.to_string(),
            state,
        }));
    }
}

impl SessionObserver for FavoritesStore {
    /// Clears synchronously, then loads the new user's favorites on a spawned task.
    fn on_session_changed(&self, state: &SessionState) {
        if let Some((load_seq, user_id)) = self.begin_user_change(state.user()) {
            let store = self.clone();
            tokio::spawn(async move {
                store.load(load_seq, user_id).await;
            });
        }
    }
}
