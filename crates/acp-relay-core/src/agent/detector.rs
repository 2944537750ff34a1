//! Backend detection
//!
//! Probes every enabled backend for a usable executable, in parallel, each
//! probe bounded by a short timeout. The result is computed once per detector
//! and shared read-only afterwards.

use super::registry::BackendRegistry;
use crate::types::{BackendConfig, DetectedAgent, BUILTIN_BACKEND_ID};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Locates an executable by name
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutableProbe: Send + Sync {
    /// Resolved path of `program`, or `None` when it is not installed
    async fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Probe using the platform's PATH lookup (`which`, or `where` on Windows)
#[derive(Debug, Default, Clone, Copy)]
pub struct PathProbe;

#[async_trait]
impl ExecutableProbe for PathProbe {
    async fn locate(&self, program: &str) -> Option<PathBuf> {
        let finder = if cfg!(windows) { "where" } else { "which" };

        let output = Command::new(finder)
            .arg(program)
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8(output.stdout).ok()?;
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
    }
}

/// Detect-once view of which backends are usable on this machine
pub struct BackendDetector {
    registry: Arc<BackendRegistry>,
    probe: Arc<dyn ExecutableProbe>,
    probe_timeout: Duration,
    detected: OnceCell<Vec<DetectedAgent>>,
}

impl BackendDetector {
    pub fn new(
        registry: Arc<BackendRegistry>,
        probe: Arc<dyn ExecutableProbe>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            probe_timeout,
            detected: OnceCell::new(),
        }
    }

    /// Detector backed by [`PathProbe`]
    pub fn with_path_probe(registry: Arc<BackendRegistry>, probe_timeout: Duration) -> Self {
        Self::new(registry, Arc::new(PathProbe), probe_timeout)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Usable backends, baseline first. Probes only on the first call.
    pub async fn detect(&self) -> &[DetectedAgent] {
        self.detected.get_or_init(|| self.run_probes()).await
    }

    /// Same as [`detect`](Self::detect); named for the backend selection UI
    pub async fn list_detected_agents(&self) -> Vec<DetectedAgent> {
        self.detect().await.to_vec()
    }

    /// Detected entry for a backend, if it was found
    pub async fn find(&self, backend_id: &str) -> Option<DetectedAgent> {
        self.detect()
            .await
            .iter()
            .find(|a| a.backend_id == backend_id)
            .cloned()
    }

    async fn run_probes(&self) -> Vec<DetectedAgent> {
        let enabled = self.registry.list_enabled();

        let probes = enabled
            .iter()
            .filter(|b| b.requires_binary())
            .map(|backend| self.probe_backend(backend));

        let found: Vec<DetectedAgent> = join_all(probes).await.into_iter().flatten().collect();

        let mut result = Vec::with_capacity(found.len() + 1);
        if !found.is_empty() {
            if let Some(baseline) = enabled
                .iter()
                .find(|b| !b.requires_binary() && b.id == BUILTIN_BACKEND_ID)
            {
                result.push(DetectedAgent {
                    backend_id: baseline.id.clone(),
                    display_name: baseline.name.clone(),
                    path: None,
                });
            }
        }
        result.extend(found);

        info!(
            "Detected {} agent backend(s): {:?}",
            result.len(),
            result.iter().map(|a| a.backend_id.as_str()).collect::<Vec<_>>()
        );
        result
    }

    async fn probe_backend(&self, backend: &BackendConfig) -> Option<DetectedAgent> {
        let command = backend.command.as_ref()?;

        let located = tokio::time::timeout(self.probe_timeout, self.probe.locate(&command.program))
            .await
            .unwrap_or_else(|_| {
                debug!("Probe for {} timed out", backend.id);
                None
            });

        let path = match located {
            Some(path) => path,
            None => {
                let fallback = backend.default_path.as_ref()?;
                if !tokio::fs::metadata(fallback).await.map(|m| m.is_file()).unwrap_or(false) {
                    debug!("Backend {} not found", backend.id);
                    return None;
                }
                fallback.clone()
            }
        };

        debug!("Backend {} found at {:?}", backend.id, path);
        Some(DetectedAgent {
            backend_id: backend.id.clone(),
            display_name: backend.name.clone(),
            path: Some(path),
        })
    }
}
