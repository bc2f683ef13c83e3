//! Sync orchestration: parameter validation, candidate paging, the per-item
//! fetch/extract/update pipeline, cooperative cancellation and the aggregate
//! run summary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use refsync_core::{Resource, UpdateMode};
use refsync_extract::{apply_mapping, CountryTable, MappingError, MappingSet};
use refsync_fetch::{FetchError, RecordFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod store;
pub mod update;

pub use store::{
    HttpResourceStore, MemoryStore, RepositoryConfig, ResourceStore, SearchQuery, StoreError,
};
pub use update::{update_resource, UpdateOutcome, ALL_PROPERTIES};

pub const CRATE_NAME: &str = "refsync-sync";

/// Page size of the candidate query, bounding each repository request.
pub const PAGE_SIZE: usize = 100;

/// Datatypes the sync knows how to read the authority URI from.
pub const MANAGED_DATATYPES: [&str; 4] = [
    "literal",
    "uri",
    "valuesuggest:idref:person",
    "valuesuggest:idref:corporation",
];

/// Parameters of one sync run, validated once and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncParams {
    pub mode: UpdateMode,
    /// Parsed key-value filter expression in the repository's query syntax.
    #[serde(default)]
    pub query: Vec<(String, String)>,
    /// Target property terms, or the single sentinel `all`.
    pub properties: Vec<String>,
    /// Datatype names, or `all` for every managed datatype.
    #[serde(default)]
    pub datatypes: Vec<String>,
    /// Property holding the link to the authority record.
    pub property_uri: String,
    /// Optional mapping group used when the category has none.
    #[serde(default)]
    pub mapping_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("the properties to update are not configured")]
    NoProperties,
    #[error("the property holding the uri is not configured or unknown: {0:?}")]
    UnknownUriProperty(String),
    #[error("none of the configured datatypes is managed")]
    NoDatatypes,
    #[error("mapping definitions unavailable: {0}")]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Cooperative cancellation signal, polled at item boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Aggregate of one run. Counters only ever increase; the run always ends
/// with exactly one summary, cancelled or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_expected: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub no_new_data: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Counters {
    processed: usize,
    succeeded: usize,
    no_new_data: usize,
    failed: usize,
    skipped: usize,
}

/// One sync run over a repository store and an authority fetcher. The
/// pipeline owns the fetcher (and with it the run-scoped record cache), so
/// dropping the pipeline at the end of `run` discards the cache.
pub struct SyncPipeline<'a, F: RecordFetcher> {
    store: &'a dyn ResourceStore,
    fetcher: F,
    mappings: MappingSet,
    countries: CountryTable,
    cancel: CancelFlag,
}

impl<'a, F: RecordFetcher> SyncPipeline<'a, F> {
    pub fn new(
        store: &'a dyn ResourceStore,
        fetcher: F,
        mappings: MappingSet,
        countries: CountryTable,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            store,
            fetcher,
            mappings,
            countries,
            cancel,
        }
    }

    /// Execute the run to completion, cancellation or validation failure.
    /// Per-item failures never escape; they are counted and logged.
    pub async fn run(mut self, params: &SyncParams) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // Validating.
        if params.properties.is_empty() {
            return Err(SyncError::NoProperties);
        }
        let datatypes = managed_datatypes(&params.datatypes);
        if datatypes.is_empty() {
            return Err(SyncError::NoDatatypes);
        }
        let property_ids = self.store.property_ids().await?;
        let Some(&uri_property_id) = property_ids.get(&params.property_uri) else {
            return Err(SyncError::UnknownUriProperty(params.property_uri.clone()));
        };

        let query = SearchQuery {
            filters: params.query.clone(),
            has_property: Some(uri_property_id),
        };

        let total_expected = self.store.total(&query).await?;
        let mut counters = Counters::default();
        let mut cancelled = false;

        if total_expected == 0 {
            warn!(%run_id, "no resource selected, you may check your query");
            return Ok(self.summary(run_id, started_at, total_expected, counters, cancelled));
        }

        info!(%run_id, total_expected, "starting processing resources with uri");

        // Paging.
        let mut offset = 0;
        'pages: loop {
            let page = self.store.search(&query, PAGE_SIZE, offset).await?;
            if page.is_empty() {
                break;
            }

            for (key, resource) in page.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    warn!(
                        %run_id,
                        processed = offset + key,
                        total_expected,
                        "the run was stopped by cancellation"
                    );
                    cancelled = true;
                    break 'pages;
                }

                self.process_item(resource, params, &datatypes, &property_ids, &mut counters)
                    .await;
                counters.processed += 1;
            }

            // Bound memory growth across large candidate sets; the record
            // cache intentionally persists for the whole run.
            self.store.clear_working_set().await?;
            offset += PAGE_SIZE;
        }

        Ok(self.summary(run_id, started_at, total_expected, counters, cancelled))
    }

    async fn process_item(
        &mut self,
        resource: &Resource,
        params: &SyncParams,
        datatypes: &[String],
        property_ids: &std::collections::BTreeMap<String, u64>,
        counters: &mut Counters,
    ) {
        let Some(value) = resource.value_of(&params.property_uri, datatypes) else {
            warn!(id = resource.id, "resource skipped: no value");
            counters.skipped += 1;
            return;
        };

        let url = value
            .uri
            .as_deref()
            .or(value.literal.as_deref())
            .filter(|s| !s.is_empty());
        let Some(url) = url else {
            warn!(id = resource.id, "resource skipped: no uri in value");
            counters.skipped += 1;
            return;
        };

        let Some(maps) = self
            .mappings
            .resolve(&value.datatype, params.mapping_key.as_deref())
        else {
            warn!(
                id = resource.id,
                datatype = %value.datatype,
                "resource skipped: unable to determine a mapping group"
            );
            counters.skipped += 1;
            return;
        };

        let Some(document) = self.fetcher.fetch(url).await else {
            error!(id = resource.id, %url, "authority record not available");
            counters.failed += 1;
            return;
        };

        let values = apply_mapping(maps, &document, &self.countries);
        match update_resource(
            self.store,
            resource,
            &values,
            params.mode,
            &params.properties,
            property_ids,
        )
        .await
        {
            UpdateOutcome::Updated => {
                info!(id = resource.id, %url, "resource has new data");
                counters.succeeded += 1;
            }
            UpdateOutcome::NoNewData => counters.no_new_data += 1,
            UpdateOutcome::Failed => counters.failed += 1,
        }
    }

    fn summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        total_expected: usize,
        counters: Counters,
        cancelled: bool,
    ) -> SyncSummary {
        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_expected,
            processed: counters.processed,
            succeeded: counters.succeeded,
            no_new_data: counters.no_new_data,
            failed: counters.failed,
            skipped: counters.skipped,
            cancelled,
        };
        info!(
            run_id = %summary.run_id,
            processed = summary.processed,
            total_expected = summary.total_expected,
            succeeded = summary.succeeded,
            no_new_data = summary.no_new_data,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "end of sync run"
        );
        summary
    }
}

/// Intersect the requested datatype names with the managed set; an empty
/// request or the `all` sentinel selects every managed datatype.
pub fn managed_datatypes(requested: &[String]) -> Vec<String> {
    if requested.is_empty() || requested.iter().any(|d| d == "all") {
        return MANAGED_DATATYPES.iter().map(|d| d.to_string()).collect();
    }
    MANAGED_DATATYPES
        .iter()
        .filter(|managed| requested.iter().any(|d| d == *managed))
        .map(|d| d.to_string())
        .collect()
}
