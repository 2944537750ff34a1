//! acp-relay core library
//!
//! Client side of the Agent Client Protocol for driving external coding
//! agents as session participants:
//! - Backend catalog and detection of installed agents
//! - Session lifecycle over JSON-RPC stdio, with request correlation
//! - Ordered per-session update streams
//! - Tool call tracking and permission gating
//! - Failure classification, retry and credential rotation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     acp-relay-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  acp/          - Protocol, connection, sessions, dispatch   │
//! │  agent/        - Backend registry, detection, local agent   │
//! │  sandbox/      - Workspace confinement for file requests    │
//! │  config.rs     - Relay configuration                        │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod acp;
pub mod agent;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod types;

// Re-export commonly used types
pub use config::{RelayConfig, RetryConfig};
pub use error::{AcpError, AcpErrorKind, AgentError, Error, Result, SandboxError};
pub use types::*;

pub use acp::{
    AgentClient, EventPayload, OpenOptions, Session, SessionEvent, SessionManager,
    SessionSummary,
};
pub use agent::{BackendDetector, BackendRegistry, EchoResponder, PromptResponder};
pub use sandbox::{SeedFile, Workspace};
