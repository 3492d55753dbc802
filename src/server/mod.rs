//! HTTP ingest and view API server.
//!
//! Ingest endpoints park the parsed payload on a bounded queue and answer
//! `ok` immediately; increments are applied by the per-kind worker threads,
//! so a slow store never delays a client. View and chart endpoints read the
//! archive only.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use crate::archive::Document;
use crate::error::StatsError;
use crate::ingest::{IngestQueue, StatsBatch};
use crate::scheduler::RollupScheduler;
use crate::service::{ChartInfo, Event, StatsKind, StatsService};

struct ServerState {
    service: Arc<StatsService>,
    apps_queue: IngestQueue,
    tasks_queue: IngestQueue,
}

type AppState = Arc<ServerState>;

/// Start the server and run until shutdown: HTTP listener, two ingest
/// workers and the rollup scheduler. The store snapshot is flushed on the
/// way out.
pub async fn serve(service: Arc<StatsService>, host: IpAddr, port: u16) -> crate::error::Result<()> {
    install_tracing_subscriber();

    let queue_capacity = service.config().queue_capacity;
    let apps_service = Arc::clone(&service);
    let apps_queue = IngestQueue::spawn("apps", queue_capacity, move |batch| {
        apps_service.apply_stats(StatsKind::Apps, &batch);
    });
    let tasks_service = Arc::clone(&service);
    let tasks_queue = IngestQueue::spawn("tasks", queue_capacity, move |batch| {
        tasks_service.apply_stats(StatsKind::Tasks, &batch);
    });

    let mut scheduler = RollupScheduler::spawn(Arc::clone(&service));

    let state = Arc::new(ServerState {
        service: Arc::clone(&service),
        apps_queue,
        tasks_queue,
    });
    let app = build_router(Arc::clone(&state));
    let addr = SocketAddr::from((host, port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "stats server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    drop(state);
    if let Err(err) = service.persist() {
        tracing::warn!(%err, "failed to flush store snapshot");
    }
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/add/", post(add_apps_stats_handler)) // legacy alias
        .route("/add/apps_stats", post(add_apps_stats_handler))
        .route("/add/tasks_stats", post(add_tasks_stats_handler))
        .route("/add/event", post(add_event_handler))
        .route("/api/stats/:kind", get(stats_docs_handler))
        .route("/api/chart/:kind/:app_id/:name", get(chart_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
}

fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}

#[derive(Debug, Serialize)]
struct QueueStats {
    depth: usize,
    dropped: u64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    time: String,
    apps_queue: QueueStats,
    tasks_queue: QueueStats,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let time = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(HealthResponse {
        status: "ok",
        time,
        apps_queue: QueueStats {
            depth: state.apps_queue.depth(),
            dropped: state.apps_queue.dropped(),
        },
        tasks_queue: QueueStats {
            depth: state.tasks_queue.depth(),
            dropped: state.tasks_queue.dropped(),
        },
    })
}

async fn add_apps_stats_handler(
    State(state): State<AppState>,
    Json(batch): Json<StatsBatch>,
) -> &'static str {
    state.apps_queue.enqueue(batch);
    "ok"
}

async fn add_tasks_stats_handler(
    State(state): State<AppState>,
    Json(batch): Json<StatsBatch>,
) -> &'static str {
    state.tasks_queue.enqueue(batch);
    "ok"
}

async fn add_event_handler(
    State(state): State<AppState>,
    Json(events): Json<Vec<Event>>,
) -> Result<&'static str, AppError> {
    state.service.add_events(events)?;
    Ok("ok")
}

#[derive(Debug, Deserialize)]
struct StatsDocsParams {
    app_id: Option<String>,
    #[serde(default = "default_sort_field")]
    sort_by_field: String,
    #[serde(default = "default_sort_period")]
    sort_by_period: String,
    #[serde(default = "default_rows")]
    rows: usize,
}

fn default_sort_field() -> String {
    "NUMBER".to_string()
}

fn default_sort_period() -> String {
    "hour".to_string()
}

fn default_rows() -> usize {
    25
}

#[derive(Debug, Serialize)]
struct StatsDocsResponse {
    docs: Vec<Document>,
    /// Names flagged by the latest anomaly run for the requested app.
    anomalies: Vec<String>,
}

async fn stats_docs_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<StatsDocsParams>,
) -> Result<Json<StatsDocsResponse>, AppError> {
    let kind: StatsKind = kind.parse()?;
    let docs = state.service.view_docs(
        kind,
        params.app_id.as_deref(),
        &params.sort_by_field,
        &params.sort_by_period,
        params.rows,
    )?;
    // Anomaly detection runs on the apps family only.
    let anomalies = match (kind, params.app_id.as_deref()) {
        (StatsKind::Apps, Some(app_id)) => state.service.anomalous_names(app_id)?,
        _ => Vec::new(),
    };
    Ok(Json(StatsDocsResponse { docs, anomalies }))
}

#[derive(Debug, Deserialize)]
struct ChartParams {
    #[serde(default = "default_chart_hours")]
    hours: u32,
}

fn default_chart_hours() -> u32 {
    6
}

#[derive(Debug, Serialize)]
struct ChartResponse {
    /// Current view row for the identifier, when the cache has one.
    doc: Option<Document>,
    #[serde(flatten)]
    info: ChartInfo,
}

async fn chart_handler(
    State(state): State<AppState>,
    Path((kind, app_id, name)): Path<(String, String, String)>,
    Query(params): Query<ChartParams>,
) -> Result<Json<ChartResponse>, AppError> {
    let kind: StatsKind = kind.parse()?;
    let info = state.service.chart_info(kind, &app_id, &name, params.hours)?;
    let doc = state.service.view_doc(kind, &app_id, &name)?;
    Ok(Json(ChartResponse { doc, info }))
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct AppError(#[from] StatsError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StatsError::InvalidArgument(_)
            | StatsError::InvalidAppId(_)
            | StatsError::InvalidName(_) => StatusCode::BAD_REQUEST,
            StatsError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorPayload {
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    message: String,
}
