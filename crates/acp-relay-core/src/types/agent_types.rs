//! Backend configuration and detection types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Identifier of the in-process baseline backend
pub const BUILTIN_BACKEND_ID: &str = "builtin";

/// How to launch an external agent binary in ACP mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }
}

/// Static description of one selectable agent backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub id: String,
    pub name: String,
    /// `None` for backends that run in-process
    pub command: Option<LaunchCommand>,
    /// Fallback executable location when the binary is not on PATH
    #[serde(default)]
    pub default_path: Option<PathBuf>,
    pub auth_required: bool,
    pub enabled: bool,
    pub supports_streaming: bool,
}

impl BackendConfig {
    pub fn external(
        id: impl Into<String>,
        name: impl Into<String>,
        command: LaunchCommand,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: Some(command),
            default_path: None,
            auth_required: true,
            enabled: true,
            supports_streaming: true,
        }
    }

    /// Whether this backend needs an external executable
    pub fn requires_binary(&self) -> bool {
        self.command.is_some()
    }

    /// Baseline backend served in-process by `LocalAgent`
    pub fn builtin() -> Self {
        Self {
            id: BUILTIN_BACKEND_ID.to_string(),
            name: "Built-in Assistant".to_string(),
            command: None,
            default_path: None,
            auth_required: false,
            enabled: true,
            supports_streaming: true,
        }
    }

    pub fn claude_code() -> Self {
        Self::external(
            "claude-code",
            "Claude Code",
            LaunchCommand::new("claude-code-acp", &[]),
        )
    }

    pub fn gemini_cli() -> Self {
        Self::external(
            "gemini-cli",
            "Gemini CLI",
            LaunchCommand::new("gemini", &["--experimental-acp"]),
        )
    }

    pub fn codex_cli() -> Self {
        Self::external("codex-cli", "Codex CLI", LaunchCommand::new("codex-acp", &[]))
    }

    pub fn goose() -> Self {
        let mut config = Self::external("goose", "Goose", LaunchCommand::new("goose", &["acp"]));
        config.auth_required = false;
        config
    }

    pub fn qwen_code() -> Self {
        let mut config = Self::external(
            "qwen-code",
            "Qwen Code",
            LaunchCommand::new("qwen", &["--experimental-acp"]),
        );
        config.enabled = false;
        config
    }

    /// Built-in catalog, baseline first
    pub fn builtin_backends() -> Vec<Self> {
        vec![
            Self::builtin(),
            Self::claude_code(),
            Self::gemini_cli(),
            Self::codex_cli(),
            Self::goose(),
            Self::qwen_code(),
        ]
    }
}

/// A backend found usable on this machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedAgent {
    pub backend_id: String,
    pub display_name: String,
    /// Absent for backends that need no external binary
    pub path: Option<PathBuf>,
}
