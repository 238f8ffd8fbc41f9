use crate::analyzer::{AgentMetricsReport, Anomaly, Regression, SessionAnalyzer};
use crate::auth::ApiKey;
use crate::config::{ApiConfig, AuthConfig, PlatformConfig};
use crate::db::{key_hint, SessionStore, SqliteStore, StoreError};
use crate::error::ApiError;
use crate::metrics::PlatformMetrics;
use crate::model::SessionAnalysis;
use crate::queue::{AnalysisQueue, QueueError, QueueManager, SessionProcessor};
use crate::signals;
use crate::wire::{IngestRequest, IngestResponse, WireSession};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRef, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_WINDOW_HOURS: u32 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared collaborators handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub queue: Arc<dyn AnalysisQueue>,
    pub analyzer: Arc<SessionAnalyzer>,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub request_timeout: Duration,
}

impl FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(platform_metrics))
        .route("/v1/sessions/ingest", post(ingest_sessions))
        .route("/v1/sessions/{session_id}", get(get_session))
        .route("/v1/sessions/{session_id}/analysis", get(get_session_analysis))
        .route("/v1/agents/{agent_name}/sessions", get(list_agent_sessions))
        .route("/v1/agents/{agent_name}/metrics", get(get_agent_metrics))
        .route("/v1/agents/{agent_name}/regressions", get(get_agent_regressions))
        .route("/v1/agents/{agent_name}/anomalies", get(get_agent_anomalies))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Run the service until SIGINT/SIGTERM.
pub async fn run(config: PlatformConfig, db_path: PathBuf) -> Result<(), ServeError> {
    let store = Arc::new(SqliteStore::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "session store opened");

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(source) => {
            store.close().await?;
            return Err(ServeError::Bind { addr, source });
        }
    };

    serve_until(listener, config, store, signals::shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves.
///
/// Workers start before the first request is accepted. On shutdown the
/// listener stops first, then the workers drain, then the store closes.
pub async fn serve_until<F>(
    listener: tokio::net::TcpListener,
    config: PlatformConfig,
    store: Arc<dyn SessionStore>,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let analyzer = Arc::new(SessionAnalyzer::new(
        store.clone(),
        config.analyzer.clone(),
    ));
    let queue = Arc::new(QueueManager::new(config.queue.clone(), Arc::clone(&analyzer)));
    let local_addr = listener.local_addr()?;

    if let Err(e) = queue.start_workers() {
        store.close().await?;
        return Err(e.into());
    }

    let state = AppState {
        store: store.clone(),
        queue: queue.clone(),
        analyzer,
        auth: config.auth.clone(),
        api: config.api.clone(),
        request_timeout: Duration::from_millis(config.server.request_timeout_ms),
    };

    tracing::info!("serve listening on {local_addr}");
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    drain_and_close(&queue, store.as_ref()).await?;
    served?;
    Ok(())
}

/// Finish queued analysis, then close the store the workers write to.
async fn drain_and_close<P: SessionProcessor + 'static>(
    queue: &QueueManager<P>,
    store: &dyn SessionStore,
) -> Result<(), StoreError> {
    queue.stop_workers().await;
    store.close().await?;
    tracing::info!("session store closed");
    Ok(())
}

/// Bound a collaborator call by the request timeout.
async fn within<F: Future>(
    state: &AppState,
    what: &'static str,
    fut: F,
) -> Result<F::Output, ApiError> {
    tokio::time::timeout(state.request_timeout, fut)
        .await
        .map_err(|_| ApiError::Timeout(what))
}

fn body_error(rejection: JsonRejection) -> ApiError {
    match rejection {
        JsonRejection::JsonDataError(e) => ApiError::InvalidRequest(e.body_text()),
        other => ApiError::MalformedBody(other.body_text()),
    }
}

fn query_error(rejection: QueryRejection) -> ApiError {
    ApiError::InvalidRequest(rejection.body_text())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "bagula-platform",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn platform_metrics(State(state): State<AppState>) -> Json<PlatformMetrics> {
    Json(
        PlatformMetrics::collect(
            state.store.as_ref(),
            state.queue.as_ref(),
            state.request_timeout,
        )
        .await,
    )
}

async fn ingest_sessions(
    State(state): State<AppState>,
    ApiKey(api_key): ApiKey,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(request) = payload.map_err(body_error)?;
    tracing::debug!(
        submitted_at = request.timestamp,
        lag_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(request.timestamp),
        "session batch received"
    );
    let sessions = request.into_sessions()?;
    let total = sessions.len();

    within(
        &state,
        "session store",
        state.store.store_sessions(&sessions, &api_key),
    )
    .await?
    .map_err(ApiError::StorageFailed)?;

    // Enqueue waits are already bounded by the queue's own timeout.
    for (queued, session) in sessions.iter().enumerate() {
        if let Err(source) = state
            .queue
            .enqueue_session_analysis(&session.session_id)
            .await
        {
            return Err(ApiError::AnalysisNotQueued {
                queued,
                total,
                source,
            });
        }
    }

    tracing::info!(sessions = total, key = %key_hint(&api_key), "session batch ingested");
    Ok(Json(IngestResponse::received(total)))
}

async fn get_session(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(session_id): Path<String>,
) -> Result<Json<WireSession>, ApiError> {
    let session = within(&state, "session store", state.store.get_session(&session_id))
        .await?
        .map_err(ApiError::Store)?
        .ok_or(ApiError::NotFound("Session"))?;
    Ok(Json(WireSession::from(&session)))
}

async fn get_session_analysis(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(session_id): Path<String>,
) -> Result<Json<SessionAnalysis>, ApiError> {
    let analysis = within(&state, "session store", state.store.get_analysis(&session_id))
        .await?
        .map_err(ApiError::Store)?
        .ok_or(ApiError::NotFound("Session analysis"))?;
    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SessionPage {
    agent_name: String,
    sessions: Vec<WireSession>,
    count: usize,
    limit: u32,
    offset: u32,
}

async fn list_agent_sessions(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(agent_name): Path<String>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<SessionPage>, ApiError> {
    let Query(params) = params.map_err(query_error)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(state.api.max_page_size);
    let offset = params.offset.unwrap_or(0);

    let sessions = within(
        &state,
        "session store",
        state.store.list_sessions(&agent_name, limit, offset),
    )
    .await?
    .map_err(ApiError::Store)?;

    let sessions: Vec<WireSession> = sessions.iter().map(WireSession::from).collect();
    Ok(Json(SessionPage {
        agent_name,
        count: sessions.len(),
        sessions,
        limit,
        offset,
    }))
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    hours: Option<u32>,
}

impl WindowParams {
    fn hours(&self, api: &ApiConfig) -> Result<u32, ApiError> {
        let hours = self.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
        if hours == 0 || hours > api.max_window_hours {
            return Err(ApiError::InvalidRequest(format!(
                "hours must be between 1 and {}",
                api.max_window_hours
            )));
        }
        Ok(hours)
    }
}

#[derive(Debug, Serialize)]
struct RegressionReport {
    agent_name: String,
    time_window_hours: u32,
    regressions: Vec<Regression>,
}

#[derive(Debug, Serialize)]
struct AnomalyReport {
    agent_name: String,
    time_window_hours: u32,
    anomalies: Vec<Anomaly>,
}

async fn get_agent_metrics(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(agent_name): Path<String>,
    params: Result<Query<WindowParams>, QueryRejection>,
) -> Result<Json<AgentMetricsReport>, ApiError> {
    let Query(params) = params.map_err(query_error)?;
    let hours = params.hours(&state.api)?;
    let report = within(
        &state,
        "analyzer",
        state.analyzer.get_agent_metrics(&agent_name, hours),
    )
    .await??;
    Ok(Json(report))
}

async fn get_agent_regressions(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(agent_name): Path<String>,
    params: Result<Query<WindowParams>, QueryRejection>,
) -> Result<Json<RegressionReport>, ApiError> {
    let Query(params) = params.map_err(query_error)?;
    let hours = params.hours(&state.api)?;
    let regressions = within(
        &state,
        "analyzer",
        state.analyzer.detect_regressions(&agent_name, hours),
    )
    .await??;
    Ok(Json(RegressionReport {
        agent_name,
        time_window_hours: hours,
        regressions,
    }))
}

async fn get_agent_anomalies(
    State(state): State<AppState>,
    _key: ApiKey,
    Path(agent_name): Path<String>,
    params: Result<Query<WindowParams>, QueryRejection>,
) -> Result<Json<AnomalyReport>, ApiError> {
    let Query(params) = params.map_err(query_error)?;
    let hours = params.hours(&state.api)?;
    let anomalies = within(
        &state,
        "analyzer",
        state.analyzer.detect_anomalies(&agent_name, hours),
    )
    .await??;
    Ok(Json(AnomalyReport {
        agent_name,
        time_window_hours: hours,
        anomalies,
    }))
}
