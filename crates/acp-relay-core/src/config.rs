//! Relay configuration
//!
//! Settings are a camelCase JSON document. Every field has a default, so an
//! absent file is equivalent to `{}`.

use crate::agent::BackendRegistry;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "ACP_RELAY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub request_timeout_ms: u64,
    pub prompt_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// `None` waits for a decision until the session closes
    pub permission_timeout_ms: Option<u64>,
    pub update_buffer: usize,
    pub max_frame_bytes: usize,
    pub retry: RetryConfig,
    pub disabled_backends: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            prompt_timeout_ms: 600_000,
            probe_timeout_ms: 1_000,
            permission_timeout_ms: None,
            update_buffer: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            retry: RetryConfig::default(),
            disabled_backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RelayConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load from `$ACP_RELAY_CONFIG`, else the per-user config directory
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|d| d.join("acp-relay").join("config.json"))
    }

    /// Force-disable backends listed in `disabledBackends`
    pub fn apply_to(&self, registry: &mut BackendRegistry) {
        for id in &self.disabled_backends {
            registry.set_enabled(id, false);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Option<Duration> {
        self.permission_timeout_ms.map(Duration::from_millis)
    }
}
