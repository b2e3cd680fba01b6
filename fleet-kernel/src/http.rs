/**
 * HTTP API - Thin adapter over the simulation supervisor
 *
 * ROUTES :
 * - GET    /health                  liveness, always "ok"
 * - GET    /system/health           bus status, reconnects, uptime, simulators
 * - GET    /simulators              snapshot of every simulated device
 * - GET    /simulators/{serial}     snapshot of one device
 * - DELETE /simulators/{serial}     stops one simulator
 * - POST   /devices/{id}/commands   {command, payload?} -> receipt, 404 if unknown
 *
 * No authentication: the API is meant for a trusted network.
 */

use crate::bus::SharedBus;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{CommandReceipt, DeviceId, DeviceSnapshot};
use crate::supervisor::{Supervisor, SupervisorError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub health: HealthTracker,
    pub bus: SharedBus,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/simulators", get(list_simulators))
        .route("/simulators/{serial}", get(get_simulator).delete(stop_simulator))
        .route("/devices/{id}/commands", post(send_command))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(app.supervisor.simulator_count(), app.bus.is_connected()))
}

// GET /simulators
async fn list_simulators(State(app): State<AppState>) -> Json<Vec<DeviceSnapshot>> {
    Json(app.supervisor.snapshots())
}

// GET /simulators/{serial}
async fn get_simulator(State(app): State<AppState>, Path(serial): Path<String>) -> Result<Json<DeviceSnapshot>, StatusCode> {
    app.supervisor.snapshot(&serial).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// DELETE /simulators/{serial}
async fn stop_simulator(State(app): State<AppState>, Path(serial): Path<String>) -> Result<Json<Value>, StatusCode> {
    if app.supervisor.stop_device(&serial).await {
        Ok(Json(json!({"status": "stopped", "serial": serial})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// POST /devices/{id}/commands
async fn send_command(
    State(app): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandReceipt>, (StatusCode, Json<Value>)> {
    match app.supervisor.submit_command(id, &request.command, request.payload).await {
        Ok(receipt) => Ok(Json(receipt)),
        Err(SupervisorError::UnknownDevice(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Device with ID {} not found", id)})),
        )),
        Err(e) => {
            error!("command {} for device {} failed: {}", request.command, id, e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::SimulationConf;
    use crate::directory::StaticDirectory;
    use crate::models::{DeviceRecord, DeviceStatus};

    async fn app_state() -> AppState {
        let bus: SharedBus = Arc::new(MemoryBus::new());
        let directory = Arc::new(StaticDirectory::new(vec![DeviceRecord {
            id: 1,
            serial: "SN-001".into(),
            name: "Phone".into(),
            model: None,
            firmware_version: Some("1.0.0".into()),
            status: DeviceStatus::Online,
        }]));
        let supervisor = Supervisor::start(bus.clone(), directory, SimulationConf::default()).await.unwrap();
        AppState { supervisor: Arc::new(supervisor), health: HealthTracker::new(), bus }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_returns_receipt() {
        let app = app_state().await;
        let request = CommandRequest { command: "restart".into(), payload: None };

        let Json(receipt) = send_command(State(app), Path(1), Json(request)).await.unwrap();
        assert_eq!(receipt.message, "Command sent");
        assert_eq!(receipt.cmd.command, "restart");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_unknown_device_is_404() {
        let app = app_state().await;
        let request = CommandRequest { command: "restart".into(), payload: None };

        let (status, Json(body)) = send_command(State(app), Path(99), Json(request)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Device with ID 99 not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulator_routes() {
        let app = app_state().await;

        let Json(list) = list_simulators(State(app.clone())).await;
        assert_eq!(list.len(), 1);

        let Json(health) = get_system_health(State(app.clone())).await;
        assert_eq!(health.simulators_running, 1);
        assert_eq!(health.bus_status, "connected");

        assert!(stop_simulator(State(app.clone()), Path("SN-001".into())).await.is_ok());
        assert_eq!(
            get_simulator(State(app.clone()), Path("SN-001".into())).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(stop_simulator(State(app), Path("SN-001".into())).await.unwrap_err(), StatusCode::NOT_FOUND);
    }
}
