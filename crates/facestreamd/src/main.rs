use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FaceStreamService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facestreamd starting");

    let config = config::Config::from_env();
    tracing::info!(
        position = %config.camera_position,
        device = config.camera_device(),
        model = %config.model_path.display(),
        "configuration loaded"
    );

    let (engine, capture) = engine::spawn_engine(&config).context("failed to start engine")?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceStreamService::new(engine.clone()))?
        .build()
        .await
        .context("failed to register on the D-Bus session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facestreamd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facestreamd shutting down");

    engine.shutdown();
    tokio::task::spawn_blocking(move || capture.join())
        .await?
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?;

    Ok(())
}
