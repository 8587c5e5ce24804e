//! Operator settings: a small JSON document at `~/.probemgr/config.json`.
//! A missing file yields defaults; unknown or missing fields are tolerated.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker pool size per scan job.
    pub concurrency: usize,
    /// Per-request timeout, seconds.
    pub timeout: u64,
    /// Outgoing requests per second per job; 0 disables limiting.
    pub rate_limit: u32,
    /// Target batch size when filling a job's queue (advisory).
    pub bulk_size: usize,
    /// Probe library root.
    pub templates_dir: PathBuf,
    /// Outbound proxy for scan traffic; empty disables.
    pub proxy_url: String,
    pub headless: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout: 30,
            rate_limit: 100,
            bulk_size: 25,
            templates_dir: default_templates_dir(),
            proxy_url: String::new(),
            headless: false,
        }
    }
}

impl Settings {
    /// Load from the per-user location; absence or unreadable content yields
    /// defaults.
    pub fn load() -> Settings {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Settings::default(),
        }
    }

    pub fn load_from(path: &Path) -> Settings {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(file = %path.display(), error = %e,
                          "Unreadable settings file, using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    /// Persist to the per-user location, creating the directory as needed.
    pub fn save(&self) -> Result<()> {
        let path = config_path().ok_or_else(|| {
            crate::error::Error::Internal("cannot resolve a home directory".into())
        })?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Internal(format!("settings encode: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// `~/.probemgr` (or `%USERPROFILE%\.probemgr` on Windows).
pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".probemgr"))
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

fn default_templates_dir() -> PathBuf {
    config_dir().map(|d| d.join("templates")).unwrap_or_else(|| PathBuf::from("templates"))
}
