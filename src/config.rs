use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Tunables loaded from `gametime.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub ping_window_minutes: i64,
    pub eta_options: Vec<i64>,
    pub invite_ttl_hours: i64,
    pub max_schedule_ahead_hours: i64,
    pub sweep_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub max_group_name_len: usize,
    pub max_display_name_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_window_minutes: 60,
            eta_options: vec![0, 5, 15],
            invite_ttl_hours: 48,
            max_schedule_ahead_hours: 24,
            sweep_interval_secs: 30,
            snapshot_interval_secs: 60,
            max_group_name_len: 40,
            max_display_name_len: 30,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.ping_window_minutes <= 0 {
            return Err(AppError::Config("pingWindowMinutes must be positive".into()));
        }
        if self.eta_options.is_empty() {
            return Err(AppError::Config("etaOptions cannot be empty".into()));
        }
        if let Some(bad) = self
            .eta_options
            .iter()
            .find(|m| **m < 0 || **m > self.ping_window_minutes)
        {
            return Err(AppError::Config(format!(
                "etaOption {} is outside 0..={}",
                bad, self.ping_window_minutes
            )));
        }
        if self.invite_ttl_hours <= 0 {
            return Err(AppError::Config("inviteTtlHours must be positive".into()));
        }
        if self.max_schedule_ahead_hours <= 0 {
            return Err(AppError::Config("maxScheduleAheadHours must be positive".into()));
        }
        if self.sweep_interval_secs == 0 || self.snapshot_interval_secs == 0 {
            return Err(AppError::Config("intervals must be at least one second".into()));
        }
        if self.max_group_name_len == 0 || self.max_display_name_len == 0 {
            return Err(AppError::Config("name limits must be positive".into()));
        }
        Ok(())
    }
}

/// Process-level settings taken from the environment.
#[derive(Debug, Clone)]
pub struct ServerEnv {
    pub port: u16,
    pub base_url: String,
    pub data_path: Option<PathBuf>,
}

impl ServerEnv {
    pub fn from_env() -> Result<Self> {
        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| AppError::Config("Invalid PORT".into()))?;

        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let data_path = std::env::var("DATA_PATH").ok().filter(|p| !p.is_empty()).map(PathBuf::from);

        Ok(Self { port, base_url: base_url.trim_end_matches('/').to_string(), data_path })
    }
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() -> Result<()> {
    init_in(&config_path(""))
}

fn init_in(base: &Path) -> Result<()> {
    if !base.exists() {
        fs::create_dir_all(base)?;
    }

    let settings_path = base.join("gametime.json");
    if !settings_path.exists() {
        fs::write(&settings_path, serde_json::to_string_pretty(&Settings::default())?)?;
        tracing::info!("Wrote default settings to {}", settings_path.display());
    }
    Ok(())
}

/// Load and validate the server settings.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&config_path("gametime.json"))
}

fn load_settings_from(path: &Path) -> Result<Settings> {
    let data = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let settings: Settings = serde_json::from_str(&data)
        .map_err(|e| AppError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    settings.validate()?;
    Ok(settings)
}
