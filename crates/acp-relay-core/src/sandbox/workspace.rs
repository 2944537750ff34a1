//! Session workspace
//!
//! The directory an agent session works in. Agent file requests are confined
//! to it; paths that resolve outside are refused.

use crate::error::{Error, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// File written into the workspace before the agent starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
    /// Relative to the workspace root
    pub path: PathBuf,
    pub contents: String,
}

impl SeedFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Bind to an existing directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = expand_home(root.as_ref());
        if !root.is_dir() {
            return Err(Error::Sandbox(SandboxError::InvalidPath(format!(
                "Workspace root is not a directory: {}",
                root.display()
            ))));
        }
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Create the root if needed and write the seed files
    pub async fn prepare(root: impl AsRef<Path>, seeds: &[SeedFile]) -> Result<Self> {
        let root = expand_home(root.as_ref());
        tokio::fs::create_dir_all(&root).await?;
        let workspace = Self::open(&root)?;

        for seed in seeds {
            if seed.path.is_absolute() {
                return Err(Error::Sandbox(SandboxError::InvalidPath(format!(
                    "Seed path must be relative: {}",
                    seed.path.display()
                ))));
            }
            let target = workspace.resolve(&seed.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &seed.contents).await?;
            debug!("Seeded {}", target.display());
        }

        info!("Prepared workspace {} ({} seed files)", workspace.root.display(), seeds.len());
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `path` (absolute, or relative to the root)
    /// after normalization. Fails when it lies outside the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let resolved = canonicalize_existing_prefix(&clean_path(&joined))?;
        if !resolved.starts_with(&self.root) {
            return Err(Error::Sandbox(SandboxError::PathOutsideWorkspace(
                path.display().to_string(),
            )));
        }
        Ok(resolved)
    }

    /// Read a text file. `line` is 1-based; `limit` caps the number of lines.
    pub async fn read_text_file(
        &self,
        path: impl AsRef<Path>,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> Result<String> {
        let target = self.resolve(&path)?;
        let content = match tokio::fs::read_to_string(&target).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Sandbox(SandboxError::FileNotFound(
                    path.as_ref().display().to_string(),
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if line.is_none() && limit.is_none() {
            return Ok(content);
        }

        let skip = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
        let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let selected: Vec<&str> = content.lines().skip(skip).take(take).collect();
        Ok(selected.join("\n"))
    }

    /// Write a text file, creating parent directories
    pub async fn write_text_file(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let target = self.resolve(&path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!("Wrote {} bytes to {}", content.len(), target.display());
        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Lexically remove `.` and `..` components
fn clean_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !matches!(components.last(), Some(Component::RootDir | Component::Prefix(_)) | None) {
                    components.pop();
                }
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }

    components.iter().collect()
}

/// Canonicalize the deepest existing ancestor and re-append the rest, so
/// symlinks inside the workspace cannot point outside it unnoticed
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut remaining = Vec::new();

    while !existing.exists() {
        let Some(name) = existing.file_name().map(|n| n.to_owned()) else {
            break;
        };
        remaining.push(name);
        if !existing.pop() {
            break;
        }
    }

    let mut result = if existing.exists() {
        existing.canonicalize().map_err(|e| {
            Error::Sandbox(SandboxError::InvalidPath(format!(
                "Failed to canonicalize {}: {}",
                existing.display(),
                e
            )))
        })?
    } else {
        existing
    };

    for name in remaining.into_iter().rev() {
        result.push(name);
    }
    Ok(result)
}
