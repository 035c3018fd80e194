use anyhow::{Context, Result};
use rollcall_core::{Rollcall, Store};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod extractor;

use config::BusKind;
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        snapshot = %config.snapshot_path.display(),
        threshold = config.similarity_threshold,
        backend = config.index_backend.as_str(),
        workers = config.workers,
        "configuration loaded"
    );

    let extractor = extractor::CommandExtractor::new(&config.extractor_command)?;

    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let rollcall = Rollcall::open(Arc::new(store), config.rollcall_config()?, extractor)
        .context("failed to load gallery")?;
    let engine = engine::EngineHandle::new(rollcall, config.workers);

    let service = RollcallService {
        engine: engine.clone(),
    };
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    engine.shutdown().await;

    Ok(())
}
