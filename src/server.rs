//! HTTP API for calibration and Ambilight results

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::calibration::preview_grid;
use crate::capture::SnapshotSlot;
use crate::color::AveragingPolicy;
use crate::config::{Config, Point};
use crate::geometry::DepthPolicy;
use crate::sampler::SamplingEngine;

/// Shared application state
pub struct AppState {
    pub engine: Arc<SamplingEngine>,
    /// Persisted configuration, updated on save
    pub config: Arc<RwLock<Config>>,
    config_path: PathBuf,
    /// Interval of the result stream, matches the sampling cadence
    cadence: Duration,
    /// Human readable frame source description
    source: String,
    /// Latest frame at the presentation resolution
    snapshot: Arc<SnapshotSlot>,
}

impl AppState {
    pub fn new(
        engine: Arc<SamplingEngine>,
        config: Arc<RwLock<Config>>,
        config_path: PathBuf,
        source: String,
        snapshot: Arc<SnapshotSlot>,
    ) -> Self {
        let cadence = Duration::from_millis(config.read().sampling.cadence_ms.max(1));
        Self {
            engine,
            config,
            config_path,
            cadence,
            source,
            snapshot,
        }
    }

    /// Write the active calibration into the config file
    pub fn save_config(&self) -> Result<()> {
        let calibration = self.engine.config();
        let mut config = self.config.write();
        calibration.write_back(&mut config, self.engine.space());
        config.save(&self.config_path)
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn ok_response() -> axum::response::Response {
    Json(json!({ "status": "ok" })).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/config/save", post(save_config))
        .route("/api/config/reset", post(reset_config))
        .route("/api/grid", post(grid))
        .route("/api/ambilight", get(get_ambilight))
        .route("/api/ambilight/stream", get(ambilight_stream))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// API response for the active calibration
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    /// Working-resolution corners
    points: [Point; 4],
    h_seg: u32,
    v_seg: u32,
    depth: DepthPolicy,
    averaging: AveragingPolicy,
    valid: bool,
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let config = state.engine.config();
    Json(ConfigResponse {
        points: config.corners,
        h_seg: config.counts.horizontal,
        v_seg: config.counts.vertical,
        depth: config.depth,
        averaging: config.averaging,
        valid: config.valid,
    })
}

/// Replace the calibration; a rejected body also marks it invalid
async fn set_config(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    match state.engine.apply_update(&body) {
        Ok(()) => ok_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn save_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.engine.config().valid {
        return error_response(StatusCode::CONFLICT, "Calibration is invalid, not saving");
    }
    match state.save_config() {
        Ok(()) => ok_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

async fn reset_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.reset();
    ok_response()
}

/// Grid preview in the request's own coordinate space; never touches state
async fn grid(body: Bytes) -> impl IntoResponse {
    match preview_grid(&body) {
        Ok(points) => Json(json!({ "points": points })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_ambilight(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.engine.result();
    if !result.valid {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No data available");
    }
    Json(&*result).into_response()
}

/// JPEG of the latest camera frame for clicking calibration corners
async fn get_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.snapshot.encode_jpeg() {
        Ok(Some(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(None) => error_response(StatusCode::SERVICE_UNAVAILABLE, "No frame available"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Newline-delimited JSON of the result at the sampling cadence
async fn ambilight_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(state.cadence))
        .map(move |_| {
            let result = state.engine.result();
            let mut line = if result.valid {
                serde_json::to_vec(&*result)
            } else {
                serde_json::to_vec(&json!({ "error": "No data available" }))
            }?;
            line.push(b'\n');
            Ok::<_, serde_json::Error>(line)
        });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    source: String,
    working_width: u32,
    working_height: u32,
    state: &'static str,
    h_segments: u32,
    v_segments: u32,
    windows: usize,
    timestamp: Option<u64>,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let calibration = state.engine.config();
    let result = state.engine.result();
    let (working_width, working_height) = {
        let config = state.config.read();
        (config.video.working_width, config.video.working_height)
    };

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        source: state.source.clone(),
        working_width,
        working_height,
        state: if calibration.valid { "sampling" } else { "idle" },
        h_segments: calibration.counts.horizontal,
        v_segments: calibration.counts.vertical,
        windows: calibration.counts.total_windows(),
        timestamp: result.valid.then_some(result.timestamp),
    })
}
