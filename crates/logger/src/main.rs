mod config;
mod consumer;
mod db;
mod message;
mod writer;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use db::EventStore;
use writer::Writer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings (logger.toml + env) ────────────────────────────────
    let settings = match Settings::load(|key| env::var(key).ok()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e:#}");
            return Ok(());
        }
    };
    let missing = settings.missing();
    if !missing.is_empty() {
        for reason in &missing {
            warn!("logger disabled: {reason}");
        }
        return Ok(());
    }
    let Some(db_url) = settings.db_url.as_deref() else {
        return Ok(());
    };

    // ── Database ────────────────────────────────────────────────────
    let store = match EventStore::connect(db_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("logger disabled: {e:#}");
            return Ok(());
        }
    };
    if let Err(e) = store.migrate().await {
        error!("logger disabled: {e:#}");
        return Ok(());
    }
    let existing = store.count().await.unwrap_or_default();
    info!(existing, topics = settings.topics.entries().len(), "event store ready");

    // ── Writer + MQTT ───────────────────────────────────────────────
    let (records, writer) =
        Writer::new(store.clone(), settings.retry, settings.dead_letter_path.clone()).spawn();

    let Some((client, eventloop)) = consumer::client(&settings) else {
        return Ok(());
    };
    let topics = Arc::new(settings.topics.clone());
    let mut bus = tokio::spawn(consumer::run(
        eventloop,
        client.clone(),
        topics,
        records,
        settings.dead_letter_path.clone(),
    ));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutting down");
            if let Err(e) = client.disconnect().await {
                warn!("mqtt disconnect failed: {e}");
                bus.abort();
            }
            let _ = bus.await;
        }
        _ = &mut bus => warn!("mqtt loop ended"),
    }

    // The bus loop owned the only sender; the writer drains and exits.
    match writer.await {
        Ok(stats) => info!(?stats, "writer drained"),
        Err(e) => error!("writer task failed: {e}"),
    }
    store.close().await;
    Ok(())
}
