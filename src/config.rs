//! Configuration loading with environment variable overrides.
//!
//! Settings come from `<config dir>/pinentryd/config.json` when present,
//! then from `PINENTRYD_*` environment variables, then from CLI flags
//! (applied by the binary). A missing config file is not an error; the
//! daemon simply stays disabled until a socket path is supplied.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Settings {
    /// Whether the server should run at all.
    pub enabled: bool,
    /// Unix socket path to listen on. `~` is expanded.
    pub socket_path: Option<String>,
    /// Shell command run to ask the human for a secret.
    pub prompt_command: Option<String>,
}

impl Settings {
    /// Path of the config file, if a config directory can be determined.
    ///
    /// `PINENTRYD_CONFIG_DIR` overrides the platform config directory
    /// (used by tests and by users who keep their config elsewhere).
    pub fn config_file() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("PINENTRYD_CONFIG_DIR") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::config_dir().map(|dir| dir.join("pinentryd").join("config.json"))
    }

    /// Load settings from the config file (if any) and apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut settings = match Self::config_file() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            _ => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PINENTRYD_ENABLED") {
            self.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("PINENTRYD_SOCKET") {
            self.socket_path = Some(v);
        }
        if let Ok(v) = std::env::var("PINENTRYD_PROMPT_COMMAND") {
            self.prompt_command = Some(v);
        }
    }

    /// The configured socket path with `~` expanded, if one is set.
    pub fn expanded_socket_path(&self) -> Option<PathBuf> {
        self.socket_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }
}
