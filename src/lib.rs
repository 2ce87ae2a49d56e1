pub mod capture;
pub mod channel;
pub mod console;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use capture::{FrameSource, LatestFrameSlot, StillImageSource};
use channel::WebSocketConnector;
use session::SessionController;
use settings::{config_path_from_env, SettingsStore};

pub use session::{ConnectionState, Phase, SessionError, SessionSnapshot};

/// Start a session against the configured detection service and drive it
/// from the terminal until the user quits.
pub async fn run() -> Result<()> {
    // Reads RUST_LOG; defaults to info.
    utils::init_logging(log::LevelFilter::Info);

    info!("distcam starting up...");

    let store = SettingsStore::new(config_path_from_env())?;
    if !store.path().exists() {
        // Leave a file with every default spelled out for the user to edit.
        match store.update(store.settings()) {
            Ok(()) => info!("wrote default settings to {}", store.path().display()),
            Err(err) => warn!("could not write default settings: {err:#}"),
        }
    }
    let mut settings = store.settings();
    settings.apply_env_overrides();
    settings.validate()?;
    info!(
        "using settings from {} (server {})",
        store.path().display(),
        settings.server_url
    );

    let source: Arc<dyn FrameSource> = match &settings.snapshot_path {
        Some(path) => Arc::new(
            StillImageSource::load(path, settings.jpeg_quality)
                .context("failed to prepare snapshot source")?,
        ),
        None => {
            warn!("no snapshot_path configured; captures and frames will be skipped");
            Arc::new(LatestFrameSlot::new())
        }
    };

    let controller = SessionController::init(settings, source, Arc::new(WebSocketConnector))?;
    let outcome = console::run_console(&controller).await;
    controller.teardown().await?;
    outcome
}
