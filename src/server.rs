use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::db::{self, SharedConn};
use crate::fetch::{self, FetchError};
use crate::parser;
use crate::scheduler::{self, ScheduleInput};

#[derive(Clone)]
pub struct AppState {
    pub conn: SharedConn,
    pub client: Client,
    pub cfg: Config,
}

impl AppState {
    pub fn new(conn: rusqlite::Connection, cfg: Config) -> Self {
        Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
            client: Client::new(),
            cfg,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/import/capture", post(import_capture))
        .route("/import/batch", post(import_batch))
        .route("/processes/update-now", post(update_now))
        .route("/api/cron/update", get(cron_update))
        .route("/api/schedule", post(save_schedule))
        .route("/api/schedule/status", get(schedule_status))
        .route("/api/stats", get(api_stats))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(component = "server", addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    url: String,
}

/// Single-shot fetch + extract, nothing persisted: returns the normalized
/// header, protocol and timeline fields so a caller can inspect a page
/// before tracking it. Bad URLs are the caller's fault (400); an
/// unreachable portal is the upstream's (502).
async fn import_capture(
    State(state): State<AppState>,
    Json(req): Json<CaptureRequest>,
) -> Result<Json<parser::ScrapeResult>, ApiError> {
    fetch::validate_url(&req.url).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;

    let html = fetch_html_for_api(&state, &req.url).await?;
    Ok(Json(parser::parse_sei(&html)))
}

async fn fetch_html_for_api(state: &AppState, url: &str) -> Result<String, ApiError> {
    fetch::fetch_html(&state.client, url, &state.cfg)
        .await
        .map_err(|e| {
            let message = match &e {
                FetchError::Status { status } => format!("upstream returned {status}"),
                FetchError::Transport(_) => format!("upstream unreachable: {e}"),
            };
            ApiError::new(StatusCode::BAD_GATEWAY, message)
        })
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    total: usize,
    success: usize,
    failed: usize,
    items: Vec<scheduler::PreviewResult>,
}

/// Batch validation never fails as a whole; every URL gets an itemized
/// verdict (fetch + extract only, nothing persisted) and the response is
/// always 200.
async fn import_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Json<BatchResponse> {
    let items = scheduler::preview_urls(&state.client, &state.cfg, req.urls).await;
    let success = items.iter().filter(|i| i.success).count();
    Json(BatchResponse {
        total: items.len(),
        success,
        failed: items.len() - success,
        items,
    })
}

async fn update_now(
    State(state): State<AppState>,
) -> Result<Json<scheduler::UpdateJobResult>, ApiError> {
    let job = scheduler::update_all_processes(&state.conn, &state.client, &state.cfg).await?;
    Ok(Json(job))
}

async fn cron_update(
    State(state): State<AppState>,
) -> Result<Json<scheduler::CronOutcome>, ApiError> {
    let outcome =
        scheduler::check_and_run_schedules(&state.conn, &state.client, &state.cfg).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    mode: String,
    #[serde(rename = "type")]
    schedule_type: Option<String>,
    daily_time: Option<String>,
    interval_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    mode: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    schedule_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    daily_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_run: Option<String>,
}

impl From<db::ScheduleRow> for ScheduleResponse {
    fn from(row: db::ScheduleRow) -> Self {
        Self {
            mode: row.mode,
            schedule_type: row.schedule_type,
            daily_time: row.daily_time,
            interval_hours: row.interval_hours,
            next_run: row.next_run,
        }
    }
}

async fn save_schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    if req.mode != "manual" && req.mode != "scheduled" {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "mode must be 'manual' or 'scheduled'",
        ));
    }
    if req.mode == "scheduled" {
        match req.schedule_type.as_deref() {
            Some("daily") if req.daily_time.is_some() => {}
            Some("interval") if req.interval_hours.is_some_and(|h| h > 0) => {}
            _ => {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "scheduled mode needs type 'daily' with dailyTime or 'interval' with intervalHours",
                ));
            }
        }
    }

    let input = ScheduleInput {
        mode: req.mode,
        schedule_type: req.schedule_type,
        daily_time: req.daily_time,
        interval_hours: req.interval_hours,
    };
    let guard = state.conn.lock().await;
    let row = scheduler::save_schedule_config(&guard, &input)?;
    Ok(Json(row.into()))
}

async fn schedule_status(
    State(state): State<AppState>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let guard = state.conn.lock().await;
    let row = db::get_schedule(&guard)
        .map_err(ApiError::from)?
        .unwrap_or(db::ScheduleRow {
            mode: "manual".to_string(),
            schedule_type: None,
            daily_time: None,
            interval_hours: None,
            next_run: None,
        });
    Ok(Json(row.into()))
}

async fn api_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let guard = state.conn.lock().await;
    let stats = db::get_stats(&guard).map_err(ApiError::from)?;
    Ok(Json(json!({
        "processos": stats.processos,
        "comFonte": stats.com_fonte,
        "protocolos": stats.protocolos,
        "andamentos": stats.andamentos,
    })))
}
