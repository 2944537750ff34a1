//! Agent backends
//!
//! This module handles:
//! - The catalog of known backends and their enabled flags
//! - Detecting which backends are installed on this machine
//! - The built-in backend that runs in-process

mod detector;
mod local;
mod registry;

pub use detector::{BackendDetector, ExecutableProbe, PathProbe};
pub use local::{EchoResponder, LocalAgent, PromptResponder};
pub use registry::BackendRegistry;
