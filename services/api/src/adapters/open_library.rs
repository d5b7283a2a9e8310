//! services/api/src/adapters/open_library.rs
//!
//! The `CatalogProvider` implementation backed by the Open Library HTTP API.
//! Records are passed through untouched; normalization happens in the core
//! gateway.

use async_trait::async_trait;
use book_finder_core::domain::{RawRecord, SearchOptions};
use book_finder_core::ports::{CatalogProvider, UpstreamError, UpstreamResult};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const SEARCH_FIELDS: &str =
    "key,title,author_name,cover_i,ratings_average,subject,first_publish_year,cover_edition_key";

#[derive(Clone)]
pub struct OpenLibraryAdapter {
    client: Client,
    base_url: String,
}

impl OpenLibraryAdapter {
    /// Builds the adapter with a client that gives up after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)], missing: &str) -> UpstreamResult<Value> {
        debug!(url, "Requesting catalog resource");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(UpstreamError::NotFound(missing.to_string())),
            status if !status.is_success() => {
                warn!(url, status = status.as_u16(), "Catalog returned an error status");
                Err(UpstreamError::Transport(format!("catalog responded with {}", status)))
            }
            _ => response.json::<Value>().await.map_err(transport),
        }
    }
}

fn transport(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transport(e.to_string())
    }
}

/// Open Library subject slugs are lowercase with underscores.
fn subject_slug(subject: &str) -> String {
    subject
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Accepts both `OL123W` and `/works/OL123W`.
fn work_id(id: &str) -> &str {
    id.trim().trim_start_matches("/works/")
}

/// Takes the record array out of a response body; anything else counts as empty.
fn records(mut body: Value, field: &str) -> Vec<RawRecord> {
    match body.get_mut(field).map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

#[async_trait]
impl CatalogProvider for OpenLibraryAdapter {
    async fn search(&self, query: &str, options: SearchOptions) -> UpstreamResult<Vec<RawRecord>> {
        let url = format!("{}/search.json", self.base_url);
        let body = self
            .get_json(
                &url,
                &[
                    ("q", query.to_string()),
                    ("limit", options.limit.to_string()),
                    ("offset", options.offset.to_string()),
                    ("fields", SEARCH_FIELDS.to_string()),
                ],
                query,
            )
            .await?;
        Ok(records(body, "docs"))
    }

    async fn fetch_by_id(&self, id: &str) -> UpstreamResult<RawRecord> {
        let id = work_id(id);
        if id.is_empty() {
            return Err(UpstreamError::NotFound(id.to_string()));
        }
        let url = format!("{}/works/{}.json", self.base_url, id);
        self.get_json(&url, &[], id).await
    }

    async fn fetch_subject(&self, subject: &str, options: SearchOptions) -> UpstreamResult<Vec<RawRecord>> {
        let slug = subject_slug(subject);
        let url = format!("{}/subjects/{}.json", self.base_url, slug);
        let body = self
            .get_json(
                &url,
                &[
                    ("limit", options.limit.to_string()),
                    ("offset", options.offset.to_string()),
                ],
                &slug,
            )
            .await?;
        Ok(records(body, "works"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subject_slug() {
        assert_eq!(subject_slug("Science Fiction"), "science_fiction");
        assert_eq!(subject_slug("  fantasy "), "fantasy");
    }

    #[test]
    fn test_work_id_strips_prefix() {
        assert_eq!(work_id("/works/OL45883W"), "OL45883W");
        assert_eq!(work_id("OL45883W"), "OL45883W");
    }

    #[test]
    fn test_records_extracts_array_or_nothing() {
        let body = json!({ "numFound": 2, "docs": [{ "key": "/works/OL1W" }, { "key": "/works/OL2W" }] });
        assert_eq!(records(body, "docs").len(), 2);
        assert!(records(json!({ "docs": null }), "docs").is_empty());
        assert!(records(json!({}), "works").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_catalog_is_transport_error() {
        let adapter = OpenLibraryAdapter::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = adapter.fetch_by_id("OL1W").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_) | UpstreamError::Timeout));
    }
}
