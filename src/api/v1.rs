use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::{send_all, AppState, OverrideOutcome, Status},
    domain::{Device, ProgramKind, Reading},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(get_status))
        .route("/devices", get(list_devices))
        .route("/devices/:name/override", post(override_device))
        .route("/program", post(select_program))
        .route("/readings", post(push_reading))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn get_status(State(st): State<AppState>) -> ApiResponse<Status> {
    ApiResponse::success(st.controller.lock().await.status())
}

pub async fn list_devices(State(st): State<AppState>) -> ApiResponse<Vec<Device>> {
    ApiResponse::success(st.controller.lock().await.devices().to_vec())
}

#[derive(Debug, Default, Deserialize)]
pub struct OverrideRequest {
    pub seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct OverrideResponse {
    pub device: String,
    pub seconds: u64,
}

/// POST /api/v1/devices/:name/override - run a device at full power
pub async fn override_device(
    State(st): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<OverrideRequest>>,
) -> Result<ApiResponse<OverrideResponse>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let seconds = req.seconds.unwrap_or(st.cfg.thresholds.override_seconds);
    if seconds == 0 {
        return Err(ApiError::BadRequest("seconds must be positive".to_string()));
    }

    let (outcome, out) = {
        let mut c = st.controller.lock().await;
        let outcome = c.override_device(&name, seconds);
        (outcome, c.drain())
    };
    tokio::spawn(send_all(out));

    match outcome {
        OverrideOutcome::Started => {
            info!(device = %name, seconds, "override requested");
            Ok(ApiResponse::success(OverrideResponse {
                device: name,
                seconds,
            }))
        }
        OverrideOutcome::AlreadyActive => {
            Err(ApiError::Conflict(format!("override of {name} already active")))
        }
        OverrideOutcome::Disabled => Err(ApiError::Conflict(format!("{name} is disabled"))),
        OverrideOutcome::Unknown => Err(ApiError::NotFound(format!("device {name}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProgramRequest {
    pub program: ProgramKind,
}

#[derive(Debug, Serialize)]
pub struct ProgramResponse {
    pub program: ProgramKind,
    pub changed: bool,
}

/// POST /api/v1/program - pin a program until the next day
pub async fn select_program(
    State(st): State<AppState>,
    Json(req): Json<ProgramRequest>,
) -> ApiResponse<ProgramResponse> {
    let (changed, out) = {
        let mut c = st.controller.lock().await;
        let changed = c.select_program(req.program);
        (changed, c.drain())
    };
    tokio::spawn(send_all(out));
    ApiResponse::success(ProgramResponse {
        program: req.program,
        changed,
    })
}

/// POST /api/v1/readings - partial telemetry from an external provider
pub async fn push_reading(State(st): State<AppState>, Json(reading): Json<Reading>) -> StatusCode {
    st.telemetry.on_reading(&reading);
    StatusCode::ACCEPTED
}
