//! Error types for acp-relay core

use serde::Serialize;
use thiserror::Error;

/// Main error type for acp-relay operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("ACP protocol error: {0}")]
    Acp(#[from] AcpError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure taxonomy of the agent session protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcpErrorKind {
    ConnectionNotReady,
    AuthenticationFailed,
    SessionExpired,
    NetworkError,
    Timeout,
    PermissionDenied,
    Unknown,
}

impl AcpErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionNotReady => "CONNECTION_NOT_READY",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECTION_NOT_READY" => Self::ConnectionNotReady,
            "AUTHENTICATION_FAILED" => Self::AuthenticationFailed,
            "SESSION_EXPIRED" => Self::SessionExpired,
            "NETWORK_ERROR" => Self::NetworkError,
            "TIMEOUT" => Self::Timeout,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "UNKNOWN" => Self::Unknown,
            _ => return None,
        })
    }

    /// Whether failures of this kind are retryable unless stated otherwise.
    /// `NetworkError` is only retryable when the cause is transient, so the
    /// default here is `false` and [`AcpError::network`] decides.
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::ConnectionNotReady | Self::Timeout)
    }
}

impl std::fmt::Display for AcpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified protocol-layer failure.
///
/// Every failure path in the session layer produces exactly one of these.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct AcpError {
    pub kind: AcpErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AcpError {
    pub fn new(kind: AcpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            details: None,
        }
    }

    pub fn connection_not_ready(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::ConnectionNotReady, message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::AuthenticationFailed, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::SessionExpired, message)
    }

    pub fn network(message: impl Into<String>, transient: bool) -> Self {
        Self::new(AcpErrorKind::NetworkError, message).with_retryable(transient)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::Timeout, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::PermissionDenied, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AcpErrorKind::Unknown, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Conditions that end a session once surfaced to the caller.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.kind,
            AcpErrorKind::AuthenticationFailed | AcpErrorKind::SessionExpired
        )
    }
}

/// Backend and session bookkeeping errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Backend not found: {0}")]
    NotFound(String),

    #[error("Backend disabled: {0}")]
    Disabled(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Permission request not found: {0}")]
    PermissionNotFound(String),

    #[error("Permission option not offered: {0}")]
    UnknownOption(String),

    #[error("Tool call not found: {0}")]
    ToolCallNotFound(String),

    #[error("Credential sets neither a model nor an environment: {0}")]
    InvalidCredential(String),
}

/// Workspace confinement errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Path outside workspace: {0}")]
    PathOutsideWorkspace(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No workspace bound to session")]
    NoWorkspace,
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
