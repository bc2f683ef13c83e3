//! Remote authority-record fetching for refsync: IdRef host gating, canonical
//! record URLs and a run-scoped cache over a single reqwest client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, error};

pub mod xml;

pub use xml::{Document, Node, XmlError};

pub const CRATE_NAME: &str = "refsync-fetch";

/// Fixed User-Agent sent to the authority service.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0";

/// Host patterns owned by the authority source. A subject URI must start
/// with one of these (behind an http/https scheme, with or without "www.")
/// to be fetched at all.
const AUTHORITY_HOSTS: [&str; 1] = ["idref.fr/"];

const SCHEME_PREFIXES: [&str; 4] = ["http://", "https://", "http://www.", "https://www."];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Turn a subject URI into the canonical record URL, or `None` when the URI
/// does not point at the authority source. No network involved.
pub fn canonical_record_url(uri: &str) -> Option<String> {
    if uri.is_empty() {
        return None;
    }
    let managed = AUTHORITY_HOSTS.iter().any(|base| {
        SCHEME_PREFIXES
            .iter()
            .any(|prefix| uri.starts_with(&format!("{prefix}{base}")))
    });
    if !managed {
        return None;
    }
    Some(if uri.ends_with(".xml") {
        uri.to_string()
    } else {
        format!("{uri}.xml")
    })
}

/// Source of authority records for one sync run. `None` means not found;
/// implementations log the cause themselves.
#[async_trait]
pub trait RecordFetcher: Send {
    async fn fetch(&mut self, uri: &str) -> Option<Arc<Document>>;
}

/// Fetches and parses authority records, memoizing every outcome (including
/// negative ones) under both the input URI and the canonical URL for the
/// lifetime of one sync run. Construct one per run and drop it at run end.
#[derive(Debug)]
pub struct AuthorityFetcher {
    client: reqwest::Client,
    cache: HashMap<String, Option<Arc<Document>>>,
}

impl AuthorityFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        let client = reqwest::Client::builder()
            .gzip(true)
            .deflate(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            cache: HashMap::new(),
        })
    }

    /// Fetch the record behind `uri`. `None` means not found: non-authority
    /// host, connection error, non-success status, empty body or unparseable
    /// XML; each cause is logged distinctly. No retries.
    pub async fn fetch(&mut self, uri: &str) -> Option<Arc<Document>> {
        if let Some(hit) = self.cache.get(uri) {
            debug!(%uri, "authority record cache hit");
            return hit.clone();
        }

        let Some(url) = canonical_record_url(uri) else {
            debug!(%uri, "uri does not match the authority host, not fetched");
            self.cache.insert(uri.to_string(), None);
            return None;
        };

        if let Some(hit) = self.cache.get(&url) {
            let hit = hit.clone();
            self.cache.insert(uri.to_string(), hit.clone());
            return hit;
        }

        let outcome = self.fetch_url_xml(&url).await;
        self.cache.insert(uri.to_string(), outcome.clone());
        self.cache.insert(url, outcome.clone());
        outcome
    }

    /// Number of cached outcomes, negatives included.
    pub fn cached_outcomes(&self) -> usize {
        self.cache.len()
    }

    async fn fetch_url_xml(&self, url: &str) -> Option<Arc<Document>> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(%url, %err, "connection error when fetching authority record");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!(%url, %status, "connection issue when fetching authority record");
            return None;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                error!(%url, %err, "failed reading body of authority record");
                return None;
            }
        };
        if body.trim().is_empty() {
            error!(%url, "authority record response is empty");
            return None;
        }

        match Document::parse(&body) {
            Ok(document) => Some(Arc::new(document)),
            Err(err) => {
                error!(%url, %err, "authority record response is not xml");
                None
            }
        }
    }
}

#[async_trait]
impl RecordFetcher for AuthorityFetcher {
    async fn fetch(&mut self, uri: &str) -> Option<Arc<Document>> {
        AuthorityFetcher::fetch(self, uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_requires_the_authority_host() {
        assert_eq!(canonical_record_url(""), None);
        assert_eq!(canonical_record_url("https://example.org/028377788"), None);
        assert_eq!(canonical_record_url("ftp://idref.fr/028377788"), None);
        assert_eq!(canonical_record_url("https://notidref.fr/028377788"), None);
    }

    #[test]
    fn canonical_url_accepts_all_scheme_and_www_variants() {
        for uri in [
            "http://idref.fr/028377788",
            "https://idref.fr/028377788",
            "http://www.idref.fr/028377788",
            "https://www.idref.fr/028377788",
        ] {
            assert_eq!(
                canonical_record_url(uri).as_deref(),
                Some(format!("{uri}.xml").as_str())
            );
        }
    }

    #[test]
    fn canonical_url_keeps_existing_extension() {
        assert_eq!(
            canonical_record_url("https://www.idref.fr/028377788.xml").as_deref(),
            Some("https://www.idref.fr/028377788.xml")
        );
    }

    #[tokio::test]
    async fn unmanaged_uri_is_not_found_without_network_and_cached() {
        let mut fetcher = AuthorityFetcher::new(FetchConfig::default()).unwrap();
        assert!(fetcher.fetch("https://example.org/rec").await.is_none());
        assert_eq!(fetcher.cached_outcomes(), 1);
        // Second call is a negative cache hit.
        assert!(fetcher.fetch("https://example.org/rec").await.is_none());
        assert_eq!(fetcher.cached_outcomes(), 1);
    }
}
