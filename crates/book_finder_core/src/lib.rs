pub mod catalog;
pub mod domain;
pub mod favorites;
pub mod guard;
pub mod ports;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{normalize, CatalogGateway};
pub use domain::{CanonicalBook, FavoriteEntry, RawRecord, SearchOptions, Session, SessionState, User};
pub use favorites::{
    FavoritesError, FavoritesEvent, FavoritesPhase, FavoritesSnapshot, FavoritesStore, Mutation,
    MutationKind, MutationState,
};
pub use guard::{AccessGuard, Guarded, Requirement};
pub use ports::{
    AuthBackend, AuthError, CatalogProvider, FavoritesRepository, PersistenceError, UpstreamError,
};
pub use session::{SessionObserver, SessionProvider};
