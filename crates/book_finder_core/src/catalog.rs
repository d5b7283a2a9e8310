//! crates/book_finder_core/src/catalog.rs
//!
//! The catalog gateway: talks to the external book provider through the
//! `CatalogProvider` port and turns whatever it returns into `CanonicalBook`s.
//!
//! ## Field precedence
//!
//! Upstream records arrive in several incompatible shapes. Every canonical
//! field is read through one ordered accessor list below; the first accessor
//! that yields a populated value wins, otherwise the documented default is
//! used. The order is always:
//!
//! 1. camelCase nested object (`volumeInfo.*`)
//! 2. snake_case nested object (`volume_info.*`)
//! 3. the canonical flat shape (`thumbnailUrl`, `publishedYear`, ...), so a
//!    serialized `CanonicalBook` normalizes to itself
//! 4. Open Library search docs and work records (`author_name`, `cover_i`, ...)

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{CanonicalBook, RawRecord, SearchOptions};
use crate::ports::{CatalogProvider, UpstreamResult};

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";
pub const UNKNOWN_YEAR: &str = "Unknown";
pub const PLACEHOLDER_THUMBNAIL: &str = "/placeholder.svg?height=300&width=200";
pub const COVERS_BASE_URL: &str = "https://covers.openlibrary.org";

const MAX_CATEGORIES: usize = 3;

//=========================================================================================
// Accessor Tables
//=========================================================================================

type Accessor<T> = (&'static str, fn(&Value) -> Option<T>);

const ID: &[Accessor<String>] = &[
    ("/id", text),
    ("/book_id", text),
    ("/key", work_key),
    ("/cover_edition_key", text),
];

const TITLE: &[Accessor<String>] = &[
    ("/volumeInfo/title", text),
    ("/volume_info/title", text),
    ("/title", text),
];

const AUTHORS: &[Accessor<Vec<String>>] = &[
    ("/volumeInfo/authors", names),
    ("/volume_info/authors", names),
    ("/authors", names),
    ("/author_name", names),
];

const THUMBNAIL: &[Accessor<String>] = &[
    ("/volumeInfo/imageLinks/thumbnail", text),
    ("/volume_info/imageLinks/thumbnail", text),
    ("/volume_info/image_links/thumbnail", text),
    ("/thumbnailUrl", text),
    ("/cover_i", cover),
    ("/cover_id", cover),
    ("/covers/0", cover),
];

const RATING: &[Accessor<f64>] = &[
    ("/volumeInfo/averageRating", number),
    ("/volume_info/averageRating", number),
    ("/volume_info/average_rating", number),
    ("/rating", number),
    ("/ratings_average", number),
];

const CATEGORIES: &[Accessor<Vec<String>>] = &[
    ("/volumeInfo/categories", names),
    ("/volume_info/categories", names),
    ("/categories", names),
    ("/subject", names),
    ("/subjects", names),
];

const PUBLISHED_YEAR: &[Accessor<String>] = &[
    ("/volumeInfo/publishedDate", year),
    ("/volume_info/publishedDate", year),
    ("/volume_info/published_date", year),
    ("/publishedYear", year),
    ("/first_publish_year", year),
    ("/first_publish_date", year),
];

fn first_populated<T>(raw: &Value, accessors: &[Accessor<T>]) -> Option<T> {
    accessors
        .iter()
        .find_map(|(pointer, extract)| raw.pointer(pointer).and_then(extract))
}

//=========================================================================================
// Extractors
//=========================================================================================

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn work_key(value: &Value) -> Option<String> {
    text(value).map(|key| {
        key.trim_start_matches("/works/")
            .trim_start_matches("/books/")
            .to_string()
    })
}

/// A list of names: plain strings, `{ "name": .. }` objects, or a single string.
fn names(value: &Value) -> Option<Vec<String>> {
    let collected: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => map.get("name").and_then(text),
                other => text(other),
            })
            .collect(),
        other => text(other).into_iter().collect(),
    };
    (!collected.is_empty()).then_some(collected)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n: &f64| n.is_finite())
}

fn year(value: &Value) -> Option<String> {
    let raw = text(value)?;
    let year = raw.split('-').next().unwrap_or_default().trim();
    (!year.is_empty()).then(|| year.to_string())
}

fn cover(value: &Value) -> Option<String> {
    let id = value.as_i64().filter(|id| *id > 0)?;
    Some(cover_url(id, CoverSize::Medium))
}

//=========================================================================================
// Normalization
//=========================================================================================

/// Open Library cover image sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverSize {
    Small,
    Medium,
    Large,
}

impl CoverSize {
    fn suffix(self) -> &'static str {
        match self {
            CoverSize::Small => "S",
            CoverSize::Medium => "M",
            CoverSize::Large => "L",
        }
    }
}

pub fn cover_url(cover_id: i64, size: CoverSize) -> String {
    format!("{}/b/id/{}-{}.jpg", COVERS_BASE_URL, cover_id, size.suffix())
}

/// Converts any supported upstream shape into a `CanonicalBook`.
///
/// Never fails: each missing field falls back to its default. A record with
/// no usable identifier gets a random one so it can still be displayed.
pub fn normalize(raw: &RawRecord) -> CanonicalBook {
    let mut categories = first_populated(raw, CATEGORIES).unwrap_or_default();
    categories.truncate(MAX_CATEGORIES);

    CanonicalBook {
        id: first_populated(raw, ID).unwrap_or_else(|| Uuid::new_v4().to_string()),
        title: first_populated(raw, TITLE).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        authors: first_populated(raw, AUTHORS).unwrap_or_else(|| vec![UNKNOWN_AUTHOR.to_string()]),
        thumbnail_url: first_populated(raw, THUMBNAIL)
            .unwrap_or_else(|| PLACEHOLDER_THUMBNAIL.to_string()),
        rating: first_populated(raw, RATING).unwrap_or(0.0),
        categories,
        published_year: first_populated(raw, PUBLISHED_YEAR)
            .unwrap_or_else(|| UNKNOWN_YEAR.to_string()),
    }
}

//=========================================================================================
// Gateway
//=========================================================================================

/// Front door to the external catalog. Cheap to clone.
#[derive(Clone)]
pub struct CatalogGateway {
    provider: Arc<dyn CatalogProvider>,
}

impl CatalogGateway {
    pub fn new(provider: Arc<dyn CatalogProvider>) -> Self {
        Self { provider }
    }

    /// Raw keyword search. A blank query short-circuits to no results.
    pub async fn search(&self, query: &str, options: SearchOptions) -> UpstreamResult<Vec<RawRecord>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.provider.search(query, options).await?;
        debug!(query, count = records.len(), "Catalog search completed");
        Ok(records)
    }

    pub async fn fetch_by_id(&self, id: &str) -> UpstreamResult<RawRecord> {
        self.provider.fetch_by_id(id).await
    }

    pub async fn fetch_subject(
        &self,
        subject: &str,
        options: SearchOptions,
    ) -> UpstreamResult<Vec<RawRecord>> {
        let records = self.provider.fetch_subject(subject, options).await?;
        debug!(subject, count = records.len(), "Catalog subject fetched");
        Ok(records)
    }

    pub async fn search_books(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> UpstreamResult<Vec<CanonicalBook>> {
        let records = self.search(query, options).await?;
        Ok(records.iter().map(normalize).collect())
    }

    /// Fetches and normalizes one book. The requested id is kept even when the
    /// upstream record spells its own key differently.
    pub async fn fetch_book(&self, id: &str) -> UpstreamResult<CanonicalBook> {
        let raw = self.fetch_by_id(id).await?;
        let mut book = normalize(&raw);
        book.id = id.to_string();
        Ok(book)
    }

    pub async fn subject_books(
        &self,
        subject: &str,
        options: SearchOptions,
    ) -> UpstreamResult<Vec<CanonicalBook>> {
        let records = self.fetch_subject(subject, options).await?;
        Ok(records.iter().map(normalize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::UpstreamError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_normalize_empty_record_uses_defaults() {
        let book = normalize(&json!({}));
        assert_eq!(book.title(), "Unknown Title");
        assert_eq!(book.authors(), ["Unknown Author"]);
        assert_eq!(book.thumbnail_url(), PLACEHOLDER_THUMBNAIL);
        assert_eq!(book.rating(), 0.0);
        assert!(book.categories().is_empty());
        assert_eq!(book.published_year(), "Unknown");
        assert!(!book.id().is_empty());
    }

    #[test]
    fn test_normalize_camel_case_shape() {
        let raw = json!({
            "id": "OL123W",
            "volumeInfo": {
                "title": "Dune",
                "authors": ["Frank Herbert"],
                "imageLinks": { "thumbnail": "https://img/dune.jpg" },
                "averageRating": 4.3,
                "categories": ["Fiction"],
                "publishedDate": "1965-08-01"
            }
        });
        let book = normalize(&raw);
        assert_eq!(book.id(), "OL123W");
        assert_eq!(book.title(), "Dune");
        assert_eq!(book.authors(), ["Frank Herbert"]);
        assert_eq!(book.thumbnail_url(), "https://img/dune.jpg");
        assert_eq!(book.rating(), 4.3);
        assert_eq!(book.categories(), ["Fiction"]);
        assert_eq!(book.published_year(), "1965");
    }

    #[test]
    fn test_normalize_snake_case_shape() {
        let raw = json!({
            "book_id": "OL9W",
            "volume_info": {
                "title": "Emma",
                "authors": ["Jane Austen"],
                "image_links": { "thumbnail": "https://img/emma.jpg" },
                "average_rating": "3.9",
                "categories": ["Classics", "Romance"],
                "published_date": "1815"
            }
        });
        let book = normalize(&raw);
        assert_eq!(book.id(), "OL9W");
        assert_eq!(book.title(), "Emma");
        assert_eq!(book.thumbnail_url(), "https://img/emma.jpg");
        assert_eq!(book.rating(), 3.9);
        assert_eq!(book.categories(), ["Classics", "Romance"]);
        assert_eq!(book.published_year(), "1815");
    }

    #[test]
    fn test_normalize_prefers_first_populated_accessor() {
        let raw = json!({
            "volumeInfo": { "title": "  ", "authors": [] },
            "volume_info": { "title": "Fallback Title", "authors": ["Snake Author"] }
        });
        let book = normalize(&raw);
        assert_eq!(book.title(), "Fallback Title");
        assert_eq!(book.authors(), ["Snake Author"]);

        let both = json!({
            "volumeInfo": { "title": "Camel" },
            "volume_info": { "title": "Snake" }
        });
        assert_eq!(normalize(&both).title(), "Camel");
    }

    #[test]
    fn test_normalize_open_library_search_doc() {
        let raw = json!({
            "key": "/works/OL45883W",
            "title": "The Hobbit",
            "author_name": ["J.R.R. Tolkien"],
            "cover_i": 6979861,
            "ratings_average": 4.25,
            "subject": ["Fantasy", "Dragons", "Dwarves", "Wizards"],
            "first_publish_year": 1937
        });
        let book = normalize(&raw);
        assert_eq!(book.id(), "OL45883W");
        assert_eq!(book.authors(), ["J.R.R. Tolkien"]);
        assert_eq!(
            book.thumbnail_url(),
            "https://covers.openlibrary.org/b/id/6979861-M.jpg"
        );
        assert_eq!(book.categories().len(), 3);
        assert_eq!(book.published_year(), "1937");
    }

    #[test]
    fn test_normalize_work_record_with_named_authors() {
        let raw = json!({
            "key": "/works/OL1W",
            "title": "Work",
            "authors": [{ "name": "Someone" }, { "author": { "key": "/authors/OL1A" } }],
            "covers": [42],
            "subjects": ["History"]
        });
        let book = normalize(&raw);
        assert_eq!(book.authors(), ["Someone"]);
        assert_eq!(book.thumbnail_url(), cover_url(42, CoverSize::Medium));
        assert_eq!(book.categories(), ["History"]);
    }

    #[test]
    fn test_normalize_is_idempotent_on_canonical_json() {
        let raw = json!({
            "key": "/works/OL7W",
            "title": "Beloved",
            "author_name": ["Toni Morrison"],
            "ratings_average": 4.0,
            "first_publish_year": 1987
        });
        let book = normalize(&raw);
        let again = normalize(&serde_json::to_value(&book).unwrap());
        assert_eq!(book, again);
    }

    struct StubProvider {
        records: Vec<RawRecord>,
        searches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CatalogProvider for StubProvider {
        async fn search(&self, query: &str, _options: SearchOptions) -> UpstreamResult<Vec<RawRecord>> {
            self.searches.lock().push(query.to_string());
            Ok(self.records.clone())
        }

        async fn fetch_by_id(&self, id: &str) -> UpstreamResult<RawRecord> {
            self.records
                .iter()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(id.to_string()))
        }

        async fn fetch_subject(
            &self,
            _subject: &str,
            _options: SearchOptions,
        ) -> UpstreamResult<Vec<RawRecord>> {
            Err(UpstreamError::Timeout)
        }
    }

    fn gateway(records: Vec<RawRecord>) -> (CatalogGateway, Arc<StubProvider>) {
        let provider = Arc::new(StubProvider {
            records,
            searches: Mutex::new(Vec::new()),
        });
        (CatalogGateway::new(provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_blank_query_skips_upstream() {
        let (gateway, provider) = gateway(vec![json!({ "id": "x" })]);
        let results = gateway.search("   ", SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
        assert!(provider.searches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_zero_matches_is_empty_not_error() {
        let (gateway, _) = gateway(Vec::new());
        let results = gateway.search_books("nothing", SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_book_keeps_requested_id() {
        let (gateway, _) = gateway(vec![json!({ "id": "OL5W", "title": "Five" })]);
        let book = gateway.fetch_book("OL5W").await.unwrap();
        assert_eq!(book.id(), "OL5W");
        assert_eq!(book.title(), "Five");

        let missing = gateway.fetch_book("OL6W").await;
        assert_eq!(missing, Err(UpstreamError::NotFound("OL6W".to_string())));
    }

    #[tokio::test]
    async fn test_upstream_errors_are_surfaced() {
        let (gateway, _) = gateway(Vec::new());
        let result = gateway.subject_books("fantasy", SearchOptions::default()).await;
        assert_eq!(result, Err(UpstreamError::Timeout));
    }
}
