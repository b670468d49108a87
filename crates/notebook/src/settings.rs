//! Editor settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/terminal-notebook/settings.json
//! - Linux: ~/.config/terminal-notebook/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\terminal-notebook\settings.json

use anyhow::Result;
use kernel_proxy::KernelConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cell::{CellKind, DEFAULT_ID_LENGTH};

fn default_kernel_name() -> String {
    "python3".to_string()
}

fn default_execution_timeout() -> u64 {
    600
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_id_length() -> usize {
    DEFAULT_ID_LENGTH
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Kernelspec launched for `run`
    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    /// Per-cell execution limit in seconds; 0 disables it
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Kind used by the "add cell" commands
    #[serde(default)]
    pub default_cell_kind: CellKind,

    #[serde(default = "default_id_length")]
    pub cell_id_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kernel_name: default_kernel_name(),
            execution_timeout_secs: default_execution_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            default_cell_kind: CellKind::Code,
            cell_id_length: default_id_length(),
        }
    }
}

impl Settings {
    pub fn kernel_config(&self, working_dir: Option<PathBuf>) -> KernelConfig {
        KernelConfig {
            kernel_name: self.kernel_name.clone(),
            working_dir,
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            execution_timeout: match self.execution_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("terminal-notebook")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if the file is missing or
/// unreadable
pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}
