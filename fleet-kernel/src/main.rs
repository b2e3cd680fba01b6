/**
 * FLEET KERNEL - Entry point of the device simulation server
 *
 * ROLE : Wires config, bus, device directory, supervisor and HTTP API.
 * Every device found in the directory gets a simulator at boot.
 *
 * SHUTDOWN : Ctrl-C or SIGTERM stops the HTTP server, then every simulator, then the bus.
 */

use anyhow::Context;
use fleet_kernel::bus::{MemoryBus, MqttBus, SharedBus};
use fleet_kernel::config::{load_config, BusKind};
use fleet_kernel::directory::{JsonDeviceDirectory, SharedDirectory};
use fleet_kernel::health::HealthTracker;
use fleet_kernel::http::{build_router, AppState};
use fleet_kernel::monitor::watch_telemetry;
use fleet_kernel::supervisor::Supervisor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_kernel=info")))
        .init();

    let cfg = load_config().await.context("loading kernel config")?;
    let health = HealthTracker::new();

    let bus: SharedBus = match cfg.bus {
        BusKind::Mqtt => Arc::new(
            MqttBus::connect(&cfg.mqtt, health.clone())
                .await
                .with_context(|| format!("connecting to MQTT broker {}:{}", cfg.mqtt.host, cfg.mqtt.port))?,
        ),
        BusKind::Memory => {
            warn!("running on the in-memory bus, no broker traffic");
            Arc::new(MemoryBus::new())
        }
    };

    if cfg.monitor_telemetry {
        watch_telemetry(bus.as_ref()).context("subscribing telemetry monitor")?;
    }

    let directory: SharedDirectory = Arc::new(
        JsonDeviceDirectory::open(&cfg.directory.path)
            .with_context(|| format!("opening device directory {}", cfg.directory.path))?,
    );

    let supervisor = Arc::new(
        Supervisor::start(bus.clone(), directory, cfg.simulation.clone())
            .await
            .context("starting simulation supervisor")?,
    );

    let app = build_router(AppState {
        supervisor: supervisor.clone(),
        health,
        bus,
    });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP API")?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
