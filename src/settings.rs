use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::channel::ReconnectPolicy;

pub const CONFIG_PATH_ENV: &str = "DISTCAM_CONFIG";
pub const SERVER_URL_ENV: &str = "DISTCAM_SERVER_URL";
pub const DEBUG_ENV: &str = "DISTCAM_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    /// Cadence of the frame pump while measuring.
    pub frame_interval_ms: u64,
    pub fps_sample_interval_ms: u64,
    /// Zero disables the measurement watchdog.
    pub watchdog_timeout_ms: u64,
    pub calibration_marker: String,
    pub reconnect: ReconnectPolicy,
    pub snapshot_path: Option<PathBuf>,
    pub jpeg_quality: u8,
    /// Log every pumped frame at debug level.
    pub verbose_frames: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8000/ws".into(),
            frame_interval_ms: 100,
            fps_sample_interval_ms: 1000,
            watchdog_timeout_ms: 5000,
            calibration_marker: "calibration complete".into(),
            reconnect: ReconnectPolicy::default(),
            snapshot_path: None,
            jpeg_quality: 80,
            verbose_frames: false,
        }
    }
}

impl Settings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn fps_sample_interval(&self) -> Duration {
        Duration::from_millis(self.fps_sample_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        (self.watchdog_timeout_ms > 0).then(|| Duration::from_millis(self.watchdog_timeout_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            bail!("server_url must not be empty");
        }
        if self.frame_interval_ms == 0 {
            bail!("frame_interval_ms must be greater than zero");
        }
        if self.fps_sample_interval_ms == 0 {
            bail!("fps_sample_interval_ms must be greater than zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100, got {}", self.jpeg_quality);
        }
        Ok(())
    }

    /// Apply `DISTCAM_SERVER_URL` and `DISTCAM_DEBUG` on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|url| !url.trim().is_empty()) {
            self.server_url = url;
        }
        if let Some(value) = lookup(DEBUG_ENV) {
            self.verbose_frames = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }
}

/// Settings file location: `DISTCAM_CONFIG`, else `distcam.json` in the
/// working directory.
pub fn config_path_from_env() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("distcam.json"))
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring unreadable settings in {} ({err}); using defaults",
                    path.display()
                );
                Settings::default()
            })
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Settings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &Settings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
