use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Manager process configuration.
///
/// Precedence: env vars > ~/.config/relkv/config.toml > built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Manager socket path override
    pub socket_path: Option<PathBuf>,
    /// Pid file path override
    pub pid_path: Option<PathBuf>,
    /// Worker-process budget (spawn refused beyond this)
    pub max_workers: Option<usize>,
    /// Seconds to wait for a cooperative worker stop before killing
    pub stop_grace_secs: Option<u64>,
    /// Seconds to wait for a spawned worker's readiness signal
    pub ready_timeout_secs: Option<u64>,
}

const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

impl ManagerConfig {
    /// ~/.config/relkv/config.toml
    pub fn config_path() -> PathBuf {
        crate::env::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        tracing::trace!(path = %path.display(), "Loading manager config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::env::manager_socket_path)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.pid_path
            .clone()
            .unwrap_or_else(crate::env::manager_pid_path)
    }

    pub fn max_workers(&self) -> usize {
        if let Ok(v) = std::env::var(crate::env::ENV_MAX_WORKERS) {
            if let Ok(n) = v.parse() {
                return n;
            }
        }
        self.max_workers.unwrap_or(crate::env::DEFAULT_MAX_WORKERS)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ready_timeout_secs
                .unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ManagerConfig::default();
        assert!(config.max_workers() >= 1);
        assert_eq!(config.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.ready_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn toml_roundtrip() {
        let config = ManagerConfig {
            max_workers: Some(4),
            stop_grace_secs: Some(3),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ManagerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.max_workers, Some(4));
        assert_eq!(parsed.stop_grace(), Duration::from_secs(3));
    }
}
