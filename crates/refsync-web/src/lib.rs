//! Thin JSON surface over the sync core: launch a run as a background job,
//! query or cancel it, and a pass-through create proxy to the repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use refsync_core::UpdateMode;
use refsync_extract::{CountryTable, MappingSet, COUNTRY_FEED_URL};
use refsync_fetch::{AuthorityFetcher, FetchConfig};
use refsync_sync::{
    CancelFlag, HttpResourceStore, RepositoryConfig, ResourceStore, SyncParams, SyncPipeline,
    SyncSummary,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "refsync-web";

#[derive(Debug, Clone)]
enum JobStatus {
    Running,
    Completed(SyncSummary),
    Failed(String),
}

#[derive(Debug)]
struct JobEntry {
    cancel: CancelFlag,
    status: JobStatus,
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn ResourceStore>,
    mappings: MappingSet,
    countries: CountryTable,
    fetch: FetchConfig,
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        mappings: MappingSet,
        countries: CountryTable,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            store,
            mappings,
            countries,
            fetch,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Job arguments as posted by a client; the mode arrives as a plain string
/// and is validated before anything is spawned.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncJobRequest {
    pub mode: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    pub properties: Vec<String>,
    #[serde(default)]
    pub datatypes: Vec<String>,
    pub property_uri: String,
    #[serde(default)]
    pub mapping_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobView {
    job_id: Uuid,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<SyncSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl JobView {
    fn of(job_id: Uuid, entry: &JobEntry) -> Self {
        match &entry.status {
            JobStatus::Running => Self {
                job_id,
                status: "running",
                summary: None,
                error: None,
            },
            JobStatus::Completed(summary) => Self {
                job_id,
                status: "completed",
                summary: Some(summary.clone()),
                error: None,
            },
            JobStatus::Failed(message) => Self {
                job_id,
                status: "failed",
                summary: None,
                error: Some(message.clone()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/jobs", post(create_job_handler))
        .route("/sync/jobs/{id}", get(job_status_handler))
        .route("/sync/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/proxy/{resource}", post(proxy_create_handler))
        .with_state(state)
}

/// Serve from environment configuration: `REFSYNC_WEB_PORT`,
/// `REFSYNC_API_BASE_URL`, `REFSYNC_API_RESOURCE`, `REFSYNC_KEY_IDENTITY`,
/// `REFSYNC_KEY_CREDENTIAL`.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("REFSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let mut repository = RepositoryConfig::default();
    if let Ok(base_url) = std::env::var("REFSYNC_API_BASE_URL") {
        repository.base_url = base_url;
    }
    if let Ok(resource_name) = std::env::var("REFSYNC_API_RESOURCE") {
        repository.resource_name = resource_name;
    }
    repository.key_identity = std::env::var("REFSYNC_KEY_IDENTITY").ok();
    repository.key_credential = std::env::var("REFSYNC_KEY_CREDENTIAL").ok();

    let store = Arc::new(HttpResourceStore::new(repository)?);
    let mappings = MappingSet::bundled()?;
    let countries =
        CountryTable::load(COUNTRY_FEED_URL, std::time::Duration::from_secs(20)).await;
    let state = AppState::new(store, mappings, countries, FetchConfig::default());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn create_job_handler(
    State(state): State<AppState>,
    Json(request): Json<SyncJobRequest>,
) -> Response {
    let mode: UpdateMode = match request.mode.parse() {
        Ok(mode) => mode,
        Err(err) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };
    let params = SyncParams {
        mode,
        query: request.query,
        properties: request.properties,
        datatypes: request.datatypes,
        property_uri: request.property_uri,
        mapping_key: request.mapping_key,
    };

    let job_id = Uuid::new_v4();
    let cancel = CancelFlag::new();
    state.jobs.lock().expect("job registry mutex poisoned").insert(
        job_id,
        JobEntry {
            cancel: cancel.clone(),
            status: JobStatus::Running,
        },
    );

    let task_state = state.clone();
    tokio::spawn(async move {
        let outcome = run_job(&task_state, &params, cancel).await;
        let status = match outcome {
            Ok(summary) => JobStatus::Completed(summary),
            Err(message) => {
                error!(%job_id, %message, "sync job failed");
                JobStatus::Failed(message)
            }
        };
        if let Some(entry) = task_state
            .jobs
            .lock()
            .expect("job registry mutex poisoned")
            .get_mut(&job_id)
        {
            entry.status = status;
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(JobView {
            job_id,
            status: "running",
            summary: None,
            error: None,
        }),
    )
        .into_response()
}

async fn run_job(
    state: &AppState,
    params: &SyncParams,
    cancel: CancelFlag,
) -> Result<SyncSummary, String> {
    let fetcher = AuthorityFetcher::new(state.fetch.clone()).map_err(|e| e.to_string())?;
    let pipeline = SyncPipeline::new(
        state.store.as_ref(),
        fetcher,
        state.mappings.clone(),
        state.countries.clone(),
        cancel,
    );
    pipeline.run(params).await.map_err(|e| e.to_string())
}

async fn job_status_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let jobs = state.jobs.lock().expect("job registry mutex poisoned");
    match jobs.get(&id) {
        Some(entry) => Json(JobView::of(id, entry)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown job"),
    }
}

async fn cancel_job_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let jobs = state.jobs.lock().expect("job registry mutex poisoned");
    match jobs.get(&id) {
        Some(entry) => {
            entry.cancel.cancel();
            Json(JobView::of(id, entry)).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "unknown job"),
    }
}

async fn proxy_create_handler(
    State(state): State<AppState>,
    AxumPath(resource): AxumPath<String>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    match state.store.create(&resource, &payload).await {
        Ok(id) => (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response(),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}
