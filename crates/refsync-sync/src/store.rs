//! Repository collaborators behind one trait: paged search with totals, full
//! resource updates, property-term resolution and the page-boundary
//! working-set clear. Ships an HTTP client for a JSON repository API and an
//! in-memory store used by tests and the web crate's test wiring.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use refsync_core::Resource;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("searching resources: {0}")]
    Search(String),
    #[error("updating resource #{id}: {message}")]
    Update { id: u64, message: String },
    #[error("resolving property terms: {0}")]
    Properties(String),
    #[error("creating resource: {0}")]
    Create(String),
}

/// A parsed key-value filter expression plus the injected "property has any
/// value" restriction on the URI-bearing property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub filters: Vec<(String, String)>,
    pub has_property: Option<u64>,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Total number of resources matching the query.
    async fn total(&self, query: &SearchQuery) -> Result<usize, StoreError>;

    /// One page of matching resources, in a stable order.
    async fn search(
        &self,
        query: &SearchQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Resource>, StoreError>;

    /// Persist the full resource; raises on failure.
    async fn update(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Property term to numeric id, for every known property.
    async fn property_ids(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    /// Create a resource of the given kind from a raw payload and return the
    /// new resource id.
    async fn create(
        &self,
        resource_name: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// Release per-page working state (identity map, unit of work). Called
    /// at each page boundary; stateless stores need not override it.
    async fn clear_working_set(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub base_url: String,
    pub resource_name: String,
    pub key_identity: Option<String>,
    pub key_credential: Option<String>,
    pub timeout: std::time::Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/omeka".to_string(),
            resource_name: "items".to_string(),
            key_identity: None,
            key_credential: None,
            timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total: usize,
    #[serde(default)]
    resources: Vec<Resource>,
}

/// Client for the repository's JSON API.
#[derive(Debug)]
pub struct HttpResourceStore {
    client: reqwest::Client,
    config: RepositoryConfig,
}

impl HttpResourceStore {
    pub fn new(config: RepositoryConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Search(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.resource_name
        )
    }

    fn query_params(
        &self,
        query: &SearchQuery,
        limit: usize,
        offset: usize,
    ) -> Vec<(String, String)> {
        let mut params = query.filters.clone();
        if let Some(property_id) = query.has_property {
            params.push(("has_property".to_string(), property_id.to_string()));
        }
        params.push(("limit".to_string(), limit.to_string()));
        params.push(("offset".to_string(), offset.to_string()));
        if let (Some(identity), Some(credential)) =
            (&self.config.key_identity, &self.config.key_credential)
        {
            params.push(("key_identity".to_string(), identity.clone()));
            params.push(("key_credential".to_string(), credential.clone()));
        }
        params
    }

    async fn search_page(
        &self,
        query: &SearchQuery,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResponse, StoreError> {
        let response = self
            .client
            .get(self.search_url())
            .query(&self.query_params(query, limit, offset))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StoreError::Search(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Search(e.to_string()))
    }
}

#[async_trait]
impl ResourceStore for HttpResourceStore {
    async fn total(&self, query: &SearchQuery) -> Result<usize, StoreError> {
        Ok(self.search_page(query, 0, 0).await?.total)
    }

    async fn search(
        &self,
        query: &SearchQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Resource>, StoreError> {
        Ok(self.search_page(query, limit, offset).await?.resources)
    }

    async fn update(&self, resource: &Resource) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.search_url(), resource.id);
        self.client
            .put(url)
            .query(&self.query_params(&SearchQuery::default(), 0, 0))
            .json(resource)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StoreError::Update {
                id: resource.id,
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn create(
        &self,
        resource_name: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, StoreError> {
        #[derive(Deserialize)]
        struct Created {
            id: u64,
        }
        let url = format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            resource_name
        );
        let response = self
            .client
            .post(url)
            .query(&self.query_params(&SearchQuery::default(), 0, 0))
            .json(payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StoreError::Create(e.to_string()))?;
        let created: Created = response
            .json()
            .await
            .map_err(|e| StoreError::Create(e.to_string()))?;
        Ok(created.id)
    }

    async fn property_ids(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let url = format!(
            "{}/api/properties",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StoreError::Properties(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Properties(e.to_string()))
    }
}

/// In-memory repository for tests: applies the injected has-property filter,
/// records updates and counts working-set clears. Other filters are ignored.
#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: Mutex<BTreeMap<u64, Resource>>,
    properties: BTreeMap<String, u64>,
    fail_update_ids: Vec<u64>,
    clear_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(properties: BTreeMap<String, u64>) -> Self {
        Self {
            properties,
            ..Self::default()
        }
    }

    pub fn with_resources(mut self, resources: impl IntoIterator<Item = Resource>) -> Self {
        let map = self.resources.get_mut().expect("store mutex poisoned");
        for resource in resources {
            map.insert(resource.id, resource);
        }
        self
    }

    /// Make updates of the given resource ids fail, for error-path tests.
    pub fn failing_updates(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.fail_update_ids = ids.into_iter().collect();
        self
    }

    pub fn resource(&self, id: u64) -> Option<Resource> {
        self.resources.lock().expect("store mutex poisoned").get(&id).cloned()
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn term_of(&self, property_id: u64) -> Option<&str> {
        self.properties
            .iter()
            .find(|(_, id)| **id == property_id)
            .map(|(term, _)| term.as_str())
    }

    fn matching(&self, query: &SearchQuery) -> Vec<Resource> {
        let resources = self.resources.lock().expect("store mutex poisoned");
        resources
            .values()
            .filter(|resource| match query.has_property {
                Some(property_id) => self
                    .term_of(property_id)
                    .and_then(|term| resource.properties.get(term))
                    .is_some_and(|values| !values.is_empty()),
                None => true,
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn total(&self, query: &SearchQuery) -> Result<usize, StoreError> {
        Ok(self.matching(query).len())
    }

    async fn search(
        &self,
        query: &SearchQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Resource>, StoreError> {
        Ok(self
            .matching(query)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn update(&self, resource: &Resource) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_update_ids.contains(&resource.id) {
            return Err(StoreError::Update {
                id: resource.id,
                message: "simulated write failure".to_string(),
            });
        }
        self.resources
            .lock()
            .expect("store mutex poisoned")
            .insert(resource.id, resource.clone());
        Ok(())
    }

    async fn create(
        &self,
        resource_name: &str,
        payload: &serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut resources = self.resources.lock().expect("store mutex poisoned");
        let id = resources.keys().next_back().copied().unwrap_or(0) + 1;
        let mut resource = Resource::new(id, resource_name);
        if let Some(properties) = payload.get("properties") {
            resource.properties = serde_json::from_value(properties.clone())
                .map_err(|e| StoreError::Create(e.to_string()))?;
        }
        resources.insert(id, resource);
        Ok(id)
    }

    async fn property_ids(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        Ok(self.properties.clone())
    }

    async fn clear_working_set(&self) -> Result<(), StoreError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
