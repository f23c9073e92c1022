mod auth;
mod bus;
mod config;
mod connection;
mod envelope;
mod reconciler;
mod state;
mod topic;
mod web;

use anyhow::Result;
use std::collections::BTreeMap;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::AuthSettings;
use config::BrokerSettings;
use connection::ConnectionManager;
use reconciler::Reconciler;
use state::SystemState;
use topic::expand_instances;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file (device registry + limits) ──────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "console.toml".to_string());
    let cfg = config::load(&config_path)?;
    let broker = BrokerSettings::from_env();
    let auth = Arc::new(AuthSettings::from_env());
    if !auth.is_configured() {
        warn!("SHARED_TOKEN not set: every login will be rejected");
    }

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("console started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = bus::client(&broker);
    let manager = Arc::new(ConnectionManager::new(Arc::new(client.clone())));
    info!(host = %broker.host, port = broker.port, "mqtt client created");

    // ── Reconcilers, one per device instance ────────────────────────
    let mut devices = BTreeMap::new();
    for instance in expand_instances(&cfg.device_counts()) {
        let weight_control = cfg.weight_control_enabled(&instance.device_id);
        let reconciler =
            Reconciler::spawn(instance, Arc::clone(&manager), cfg.limits, weight_control).await;
        devices.insert(reconciler.instance().key(), reconciler);
    }
    if devices.is_empty() {
        warn!("no devices configured in {config_path}");
    }
    info!(devices = devices.len(), topics = manager.topics().len(), "registry ready");

    let driver = tokio::spawn(bus::drive(
        eventloop,
        Arc::clone(&manager),
        Arc::clone(&shared),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let devices = Arc::new(devices);
    let app_state = web::AppState {
        shared: Arc::clone(&shared),
        manager: Arc::clone(&manager),
        devices: Arc::clone(&devices),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, auth).await {
            error!("{e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for reconciler in devices.values() {
        reconciler.close();
    }
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
        driver.abort();
    }
    let _ = driver.await;
    Ok(())
}
