use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::{self, AuthSettings};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::envelope::{ConfigPayload, Position, WeightControl};
use crate::reconciler::{Delivery, DeviceChannel, Reconciler};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub manager: Arc<ConnectionManager>,
    /// Keyed by `{device_id}/{index}`.
    pub devices: Arc<BTreeMap<String, Reconciler>>,
}

impl AppState {
    fn device(&self, device: &str, index: u32) -> Result<&Reconciler, ApiError> {
        self.devices
            .get(&format!("{device}/{index}"))
            .ok_or_else(|| ApiError::NotFound(format!("unknown device {device}/{index}")))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Bus(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Bus(e) => {
                error!("bus request failed: {e:#}");
                (StatusCode::BAD_GATEWAY, format!("{e:#}"))
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CommandRequest {
    state: Position,
}

#[derive(Deserialize)]
#[serde(tag = "configType", rename_all = "camelCase")]
enum ConfigRequest {
    #[serde(rename_all = "camelCase")]
    HeartbeatInterval { heartbeat_interval: f64 },
    #[serde(rename_all = "camelCase")]
    WeightControl {
        target_weight_change: Option<f64>,
        tolerance_weight: Option<f64>,
        tolerance_duration_ms: Option<f64>,
        weight_read_interval_ms: Option<f64>,
    },
}

impl From<ConfigRequest> for ConfigPayload {
    fn from(req: ConfigRequest) -> Self {
        match req {
            ConfigRequest::HeartbeatInterval { heartbeat_interval } => {
                ConfigPayload::HeartbeatInterval { heartbeat_interval }
            }
            ConfigRequest::WeightControl {
                target_weight_change,
                tolerance_weight,
                tolerance_duration_ms,
                weight_read_interval_ms,
            } => ConfigPayload::WeightControl(WeightControl {
                target_weight_change,
                tolerance_weight,
                tolerance_duration_ms,
                weight_read_interval_ms,
            }),
        }
    }
}

#[derive(Serialize)]
struct DeliveryResponse {
    delivery: Delivery,
    device: DeviceChannel,
}

#[derive(Serialize)]
struct RefreshResponse {
    connection: ConnectionStatus,
    resubscribed: usize,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState, auth: Arc<AuthSettings>) -> Router {
    let api = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/{device}/{index}", get(device_view))
        .route("/api/devices/{device}/{index}/command", post(send_command))
        .route("/api/devices/{device}/{index}/config", post(send_config))
        .route("/api/refresh", post(refresh))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&auth),
            auth::require_session,
        ))
        .with_state(state);

    auth::router(auth).merge(api)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.devices.values().map(Reconciler::view).collect();
    let st = state.shared.read().await;
    Json(st.to_status(devices))
}

async fn device_view(
    State(state): State<AppState>,
    Path((device, index)): Path<(String, u32)>,
) -> Result<Json<DeviceChannel>, ApiError> {
    Ok(Json(state.device(&device, index)?.view()))
}

async fn send_command(
    State(state): State<AppState>,
    Path((device, index)): Path<(String, u32)>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let reconciler = state.device(&device, index)?;
    let key = reconciler.instance().key();

    let delivery = match reconciler.send_command(body.state).await {
        Ok(delivery) => delivery,
        Err(e) => {
            let mut st = state.shared.write().await;
            st.record_error(format!("{key}: command failed: {e:#}"));
            return Err(ApiError::Bus(e));
        }
    };

    let label = match body.state {
        Position::High => "HIGH",
        Position::Low => "LOW",
    };
    state
        .shared
        .write()
        .await
        .record_command(&key, label, delivery);

    Ok(Json(DeliveryResponse {
        delivery,
        device: reconciler.view(),
    }))
}

async fn send_config(
    State(state): State<AppState>,
    Path((device, index)): Path<(String, u32)>,
    Json(body): Json<ConfigRequest>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let reconciler = state.device(&device, index)?;
    let key = reconciler.instance().key();
    let update = ConfigPayload::from(body);

    let config_type = match &update {
        ConfigPayload::HeartbeatInterval { .. } => "heartbeatInterval",
        ConfigPayload::WeightControl(_) => {
            if !reconciler.view().weight_control_enabled {
                return Err(ApiError::BadRequest(format!(
                    "{key} does not support weight control"
                )));
            }
            "weightControl"
        }
    };

    let delivery = match reconciler.send_config(update).await {
        Ok(delivery) => delivery,
        Err(e) => {
            let mut st = state.shared.write().await;
            st.record_error(format!("{key}: config failed: {e:#}"));
            return Err(ApiError::Bus(e));
        }
    };
    state
        .shared
        .write()
        .await
        .record_config(&key, config_type, delivery);

    Ok(Json(DeliveryResponse {
        delivery,
        device: reconciler.view(),
    }))
}

async fn refresh(State(state): State<AppState>) -> Json<RefreshResponse> {
    let resubscribed = state.manager.refresh().await;
    Json(RefreshResponse {
        connection: state.manager.status(),
        resubscribed,
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, auth: Arc<AuthSettings>) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state, auth))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
