//! JSON API over the sync pipeline: health, status, the latest snapshot, the
//! HTML report and a manual sync trigger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, Utc};
use proxima_core::{GateState, SnapshotOrder};
use proxima_sync::report::data_document;
use proxima_sync::{render_html_report, CycleErrorKind, ServiceContext, SyncPipeline, Trigger};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CRATE_NAME: &str = "proxima-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub context: ServiceContext,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, context: ServiceContext) -> Self {
        Self { pipeline, context }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotQuery {
    order: Option<String>,
}

impl SnapshotQuery {
    fn order(&self) -> SnapshotOrder {
        match self.order.as_deref() {
            Some("period") | Some("week") => SnapshotOrder::PeriodDesc,
            _ => SnapshotOrder::ScoreDesc,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/proxima", get(snapshot_handler))
        .route("/api/proxima/report", get(report_handler))
        .route("/api/proxima/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

/// Serves until `cancel` fires, then drains in-flight requests.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = match state.pipeline.store().statistics().await {
        Ok(stats) => stats,
        Err(err) => return server_error(err.into()),
    };
    let gate = state.pipeline.gate();
    let gate_state: GateState = gate.evaluate(&Local::now());
    Json(json!({
        "status": "running",
        "environment": state.context.environment,
        "version": state.context.version,
        "startedAt": state.context.started_at,
        "uptimeSecs": state.context.uptime().as_secs(),
        "now": Utc::now(),
        "schedule": gate.to_string(),
        "gateState": gate_state,
        "notificationsEnabled": state.pipeline.notifier().is_some(),
        "statistics": stats,
        "lastCycle": state.pipeline.last_report().await,
    }))
    .into_response()
}

async fn snapshot_handler(State(state): State<Arc<AppState>>, Query(query): Query<SnapshotQuery>) -> Response {
    match state.pipeline.current_snapshot().await {
        Ok((snapshot, stats)) => Json(data_document(&snapshot, &stats, query.order())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn report_handler(State(state): State<Arc<AppState>>, Query(query): Query<SnapshotQuery>) -> Response {
    let (snapshot, stats) = match state.pipeline.current_snapshot().await {
        Ok(current) => current,
        Err(err) => return server_error(err.into()),
    };
    match render_html_report(&snapshot, &stats, query.order(), Utc::now()) {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.pipeline.run_reported(Trigger::Forced).await;
    let status = match report.error_kind {
        None => StatusCode::OK,
        Some(CycleErrorKind::Fetch) => StatusCode::BAD_GATEWAY,
        Some(CycleErrorKind::Persistence) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(report)).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "error": format!("{err:#}") })),
    )
        .into_response()
}
