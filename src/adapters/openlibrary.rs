//! Open Library HTTP client.
//!
//! [`UpstreamClient`] adapter over the public Open Library REST API. Its
//! main job besides URL plumbing is translating transport outcomes into
//! the error taxonomy the dispatcher classifies on: 404 becomes `NotFound`
//! (terminal, no retry), 429 becomes `RateLimited` carrying any
//! `Retry-After` hint, 5xx becomes `Server`, socket trouble becomes
//! `Timeout` or `Network`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};

use crate::config::LookupConfig;
use crate::domain::model::{CatalogRecord, EntityType, LookupKey};
use crate::domain::ports::UpstreamClient;
use crate::error::{Error, Result};

/// HTTP client for the Open Library catalog API.
pub struct OpenLibraryClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenLibraryClient {
    pub fn new(config: &LookupConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.attempt_timeout)
            .user_agent(concat!("metashelf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn get_json(&self, url: String) -> Result<serde_json::Value> {
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &response, &url));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Network(format!("invalid response body from {}: {}", url, e)))
    }

    /// Pull the first document out of a search envelope (`docs` for the
    /// main search endpoint, `entries`/`docs` for the author one).
    fn first_doc(envelope: &serde_json::Value) -> Option<&serde_json::Value> {
        envelope
            .get("docs")
            .or_else(|| envelope.get("entries"))
            .and_then(|d| d.as_array())
            .and_then(|docs| docs.first())
    }
}

#[async_trait]
impl UpstreamClient for OpenLibraryClient {
    #[instrument(skip(self), fields(key = %key))]
    async fn fetch_by_key(&self, key: &LookupKey) -> Result<CatalogRecord> {
        match key.entity() {
            EntityType::Book => {
                let url = format!("{}/isbn/{}.json", self.base_url, key.identifier());
                let body = self.get_json(url).await?;
                let title = body
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or(key.identifier())
                    .to_string();
                debug!(title = %title, "fetched book record");
                Ok(CatalogRecord::new(key, title).with_extra(body))
            }
            EntityType::Author => {
                let url = format!(
                    "{}/search/authors.json?q={}&limit=1",
                    self.base_url,
                    urlencoding::encode(key.identifier())
                );
                let body = self.get_json(url).await?;
                let doc = Self::first_doc(&body).ok_or_else(|| Error::NotFound {
                    entity: key.entity().to_string(),
                    key: key.identifier().to_string(),
                })?;
                let name = doc
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or(key.identifier())
                    .to_string();
                Ok(CatalogRecord::new(key, name).with_extra(doc.clone()))
            }
            EntityType::Publisher => {
                // Open Library has no publisher detail endpoint; resolve
                // through the search index instead.
                let url = format!(
                    "{}/search.json?publisher={}&limit=1",
                    self.base_url,
                    urlencoding::encode(key.identifier())
                );
                let body = self.get_json(url).await?;
                let doc = Self::first_doc(&body).ok_or_else(|| Error::NotFound {
                    entity: key.entity().to_string(),
                    key: key.identifier().to_string(),
                })?;
                let name = doc
                    .get("publisher")
                    .and_then(|p| p.as_array())
                    .and_then(|p| p.first())
                    .and_then(|p| p.as_str())
                    .unwrap_or(key.identifier())
                    .to_string();
                Ok(CatalogRecord::new(key, name).with_extra(doc.clone()))
            }
        }
    }

    #[instrument(skip(self, query), fields(entity = %entity, page, page_size))]
    async fn search(
        &self,
        entity: EntityType,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<CatalogRecord>> {
        if query.trim().is_empty() {
            return Err(Error::BadRequest("search query must not be empty".into()));
        }

        let encoded = urlencoding::encode(query);
        let url = match entity {
            EntityType::Book => format!(
                "{}/search.json?q={}&page={}&limit={}",
                self.base_url, encoded, page, page_size
            ),
            EntityType::Author => format!(
                "{}/search/authors.json?q={}&page={}&limit={}",
                self.base_url, encoded, page, page_size
            ),
            EntityType::Publisher => format!(
                "{}/search.json?publisher={}&page={}&limit={}",
                self.base_url, encoded, page, page_size
            ),
        };

        let body = self.get_json(url).await?;
        let docs = body
            .get("docs")
            .or_else(|| body.get("entries"))
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            let display_name = doc
                .get("title")
                .or_else(|| doc.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if display_name.is_empty() {
                continue;
            }
            let raw_key = doc
                .get("isbn")
                .and_then(|i| i.as_array())
                .and_then(|i| i.first())
                .and_then(|i| i.as_str())
                .unwrap_or(&display_name);
            match LookupKey::new(entity, raw_key) {
                Ok(key) => records.push(CatalogRecord::new(&key, display_name).with_extra(doc)),
                Err(_) => continue,
            }
        }
        debug!(count = records.len(), "search returned documents");
        Ok(records)
    }
}

// =============================================================================
// Error Translation
// =============================================================================

fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, response: &Response, url: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound {
            entity: "resource".to_string(),
            key: url.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            retry_after: parse_retry_after(response),
        },
        s if s.is_server_error() => Error::Server {
            status: s.as_u16(),
        },
        s => Error::BadRequest(format!("upstream returned {} for {}", s, url)),
    }
}

/// `Retry-After` in whole seconds; HTTP-date forms are ignored.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// =============================================================================
// Tests
// =============================================================================
