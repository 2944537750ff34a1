//! Backend registry
//!
//! Static catalog of known agent backends. Built once at startup, then shared
//! read-only (typically behind an `Arc`).

use crate::types::BackendConfig;
use tracing::{debug, warn};

/// Catalog of agent backends, in registration order
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<BackendConfig>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        let mut registry = Self {
            backends: Vec::with_capacity(backends.len()),
        };
        for backend in backends {
            registry.register(backend);
        }
        registry
    }

    pub fn with_builtins() -> Self {
        Self::new(BackendConfig::builtin_backends())
    }

    /// Add or replace a backend definition
    pub fn register(&mut self, backend: BackendConfig) {
        if let Some(existing) = self.backends.iter_mut().find(|b| b.id == backend.id) {
            debug!("Replacing backend definition: {}", backend.id);
            *existing = backend;
        } else {
            self.backends.push(backend);
        }
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) {
        match self.backends.iter_mut().find(|b| b.id == id) {
            Some(backend) => backend.enabled = enabled,
            None => warn!("Cannot toggle unknown backend: {}", id),
        }
    }

    /// Backends exposed to selection logic
    pub fn list_enabled(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }

    pub fn get(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
