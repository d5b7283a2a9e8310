//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the catalog and favorites endpoints and the
//! master definition for the OpenAPI specification.

use crate::error::ApiError;
use crate::web::auth::{AuthResponse, LoginRequest, SessionResponse, SessionStatus, SignupRequest};
use crate::web::state::{AppState, BrowsingContext};
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use book_finder_core::{
    normalize, CanonicalBook, FavoriteEntry, FavoritesPhase, SearchOptions, User,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::{IntoParams, OpenApi, ToSchema};

/// Upper bound for a single page of catalog results.
const MAX_PAGE_SIZE: u32 = 100;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::web::auth::signup_handler,
        crate::web::auth::login_handler,
        crate::web::auth::logout_handler,
        crate::web::auth::session_handler,
        search_books_handler,
        get_book_handler,
        subject_books_handler,
        list_favorites_handler,
        add_favorite_handler,
        remove_favorite_handler,
        favorite_status_handler,
    ),
    components(
        schemas(
            SignupRequest, LoginRequest, AuthResponse, SessionResponse, SessionStatus,
            BookResponse, FavoriteResponse, FavoritesResponse, PhaseResponse,
            AddFavoriteRequest, FavoriteStatusResponse
        )
    ),
    tags(
        (name = "Book Finder API", description = "Catalog search and per-user favorites.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// A normalized book as served to clients.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookResponse {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub thumbnail_url: String,
    pub rating: f64,
    pub categories: Vec<String>,
    pub published_year: String,
}

impl From<&CanonicalBook> for BookResponse {
    fn from(book: &CanonicalBook) -> Self {
        Self {
            id: book.id().to_string(),
            title: book.title().to_string(),
            authors: book.authors().to_vec(),
            thumbnail_url: book.thumbnail_url().to_string(),
            rating: book.rating(),
            categories: book.categories().to_vec(),
            published_year: book.published_year().to_string(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct FavoriteResponse {
    pub book_id: String,
    pub book: BookResponse,
    pub created_at: DateTime<Utc>,
}

impl From<&FavoriteEntry> for FavoriteResponse {
    fn from(entry: &FavoriteEntry) -> Self {
        Self {
            book_id: entry.book_id.clone(),
            book: BookResponse::from(&entry.snapshot),
            created_at: entry.created_at,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseResponse {
    Empty,
    Loading,
    Loaded,
}

impl From<FavoritesPhase> for PhaseResponse {
    fn from(phase: FavoritesPhase) -> Self {
        match phase {
            FavoritesPhase::Empty => PhaseResponse::Empty,
            FavoritesPhase::Loading => PhaseResponse::Loading,
            FavoritesPhase::Loaded => PhaseResponse::Loaded,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct FavoritesResponse {
    pub phase: PhaseResponse,
    pub favorites: Vec<FavoriteResponse>,
    /// Set when the last load failed; the list is then empty.
    pub error: Option<String>,
    /// Book ids with a write still in flight.
    pub pending: Vec<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct AddFavoriteRequest {
    /// The book record in any shape the catalog understands.
    #[schema(value_type = Object)]
    pub book: serde_json::Value,
}

#[derive(Serialize, ToSchema)]
pub struct FavoriteStatusResponse {
    pub book_id: String,
    pub is_favorite: bool,
    pub pending: bool,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchParams {
    /// Free-text query. Blank queries return no results.
    #[serde(default)]
    pub q: String,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn page(limit: Option<u32>, offset: Option<u32>) -> Result<SearchOptions, ApiError> {
    let defaults = SearchOptions::default();
    let limit = limit.unwrap_or(defaults.limit);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    Ok(SearchOptions {
        limit,
        offset: offset.unwrap_or(defaults.offset),
    })
}

fn books(list: &[CanonicalBook]) -> Vec<BookResponse> {
    list.iter().map(BookResponse::from).collect()
}

//=========================================================================================
// Catalog Handlers
//=========================================================================================

/// Search the catalog by keyword.
#[utoipa::path(
    get,
    path = "/books/search",
    params(SearchParams),
    responses(
        (status = 200, description = "Matching books, possibly none", body = Vec<BookResponse>),
        (status = 502, description = "Catalog unavailable"),
        (status = 504, description = "Catalog timed out")
    )
)]
pub async fn search_books_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<BookResponse>>, ApiError> {
    let options = page(params.limit, params.offset)?;
    let found = state.catalog.search_books(&params.q, options).await?;
    Ok(Json(books(&found)))
}

/// Fetch one book by its catalog id.
#[utoipa::path(
    get,
    path = "/books/{id}",
    params(("id" = String, Path, description = "Catalog work id, e.g. OL45883W")),
    responses(
        (status = 200, description = "The book", body = BookResponse),
        (status = 404, description = "No such book")
    )
)]
pub async fn get_book_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BookResponse>, ApiError> {
    let book = state.catalog.fetch_book(&id).await?;
    Ok(Json(BookResponse::from(&book)))
}

/// List books for a subject.
#[utoipa::path(
    get,
    path = "/subjects/{subject}",
    params(("subject" = String, Path, description = "Subject name, e.g. science_fiction"), PageParams),
    responses(
        (status = 200, description = "Books in the subject", body = Vec<BookResponse>),
        (status = 404, description = "Unknown subject")
    )
)]
pub async fn subject_books_handler(
    State(state): State<Arc<AppState>>,
    Path(subject): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<BookResponse>>, ApiError> {
    let options = page(params.limit, params.offset)?;
    let found = state.catalog.subject_books(&subject, options).await?;
    Ok(Json(books(&found)))
}

//=========================================================================================
// Favorites Handlers (behind `require_session`)
//=========================================================================================

/// List the signed-in user's favorites.
///
/// Waits briefly for an in-flight load so a fresh session does not see an
/// empty list that is about to fill.
#[utoipa::path(
    get,
    path = "/favorites",
    responses(
        (status = 200, description = "The user's favorites", body = FavoritesResponse),
        (status = 303, description = "Not signed in"),
        (status = 503, description = "Session still resolving")
    )
)]
pub async fn list_favorites_handler(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<Arc<BrowsingContext>>,
) -> Json<FavoritesResponse> {
    let wait = state.config.favorites_load_wait;
    if tokio::time::timeout(wait, context.favorites.settled()).await.is_err() {
        debug!("Favorites still loading after {:?}", wait);
    }
    let snapshot = context.favorites.snapshot();
    Json(FavoritesResponse {
        phase: snapshot.phase.into(),
        favorites: snapshot.entries.iter().map(FavoriteResponse::from).collect(),
        error: snapshot.last_error.map(|e| e.to_string()),
        pending: snapshot.pending,
    })
}

/// Add a book to the signed-in user's favorites. Adding one twice is a no-op.
#[utoipa::path(
    post,
    path = "/favorites",
    request_body = AddFavoriteRequest,
    responses(
        (status = 201, description = "Favorited", body = BookResponse),
        (status = 503, description = "Write failed; the add was rolled back")
    )
)]
pub async fn add_favorite_handler(
    Extension(context): Extension<Arc<BrowsingContext>>,
    Extension(user): Extension<User>,
    Json(req): Json<AddFavoriteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Normalize up front so the id in the response is the one that gets stored.
    let book = normalize(&req.book);
    let canonical = serde_json::to_value(&book)
        .map_err(|e| ApiError::Internal(format!("failed to encode book: {}", e)))?;
    context.favorites.add(user.id, &canonical).await?;
    info!(user_id = %user.id, book_id = %book.id(), "Favorite added");
    Ok((StatusCode::CREATED, Json(BookResponse::from(&book))))
}

/// Remove a book from the signed-in user's favorites. Removing one that is not
/// there is a no-op.
#[utoipa::path(
    delete,
    path = "/favorites/{book_id}",
    params(("book_id" = String, Path, description = "The favorited book id")),
    responses(
        (status = 204, description = "Removed"),
        (status = 503, description = "Delete failed; the entry was restored")
    )
)]
pub async fn remove_favorite_handler(
    Extension(context): Extension<Arc<BrowsingContext>>,
    Extension(user): Extension<User>,
    Path(book_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    context.favorites.remove(user.id, &book_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Whether one book is currently favorited.
#[utoipa::path(
    get,
    path = "/favorites/{book_id}",
    params(("book_id" = String, Path, description = "The book id")),
    responses(
        (status = 200, description = "Favorite status", body = FavoriteStatusResponse)
    )
)]
pub async fn favorite_status_handler(
    Extension(context): Extension<Arc<BrowsingContext>>,
    Path(book_id): Path<String>,
) -> Json<FavoriteStatusResponse> {
    Json(FavoriteStatusResponse {
        is_favorite: context.favorites.is_favorite(&book_id),
        pending: context.favorites.is_mutating(&book_id),
        book_id,
    })
}
