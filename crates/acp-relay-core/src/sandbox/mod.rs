//! Workspace confinement for agent file access
//!
//! This module provides:
//! - Workspace preparation with seed files
//! - Path resolution that refuses anything outside the workspace root
//! - The text file reads and writes agents request over ACP

mod workspace;

pub use workspace::{SeedFile, Workspace};
