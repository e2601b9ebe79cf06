use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod archive;
mod config;
mod dbus_interface;
mod engine;
mod workflow;

#[cfg(test)]
mod testing;

const BUS_NAME: &str = "org.freedesktop.Likeness1";
const OBJECT_PATH: &str = "/org/freedesktop/Likeness1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("likenessd starting");

    let config = config::Config::load().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let engine = engine::spawn_engine(&config).context("failed to start engine")?;

    let service = dbus_interface::LikenessService::new(
        engine,
        config.allowed_types.clone(),
        config.request_timeout(),
    );
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "likenessd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("likenessd shutting down");

    Ok(())
}
