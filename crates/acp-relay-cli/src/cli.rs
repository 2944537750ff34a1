//! Command-line definition for acp-relay

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// acp-relay - drive installed coding agents over the Agent Client Protocol.
///
/// Log verbosity follows RUST_LOG (default `acp_relay=info`); logs go to
/// stderr so agent output on stdout stays clean.
#[derive(Parser, Debug)]
#[command(name = "acp-relay")]
#[command(version)]
#[command(about = "Drive installed coding agents over the Agent Client Protocol")]
pub struct Cli {
    /// Config file (defaults to $ACP_RELAY_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List agents installed on this machine
    Agents {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send one prompt to an agent and stream its reply
    Chat {
        /// Backend id (see `agents`)
        #[arg(long, default_value = "builtin")]
        backend: String,

        /// Directory the agent may read and write
        #[arg(long, value_name = "DIR")]
        workspace: Option<PathBuf>,

        /// Session id
        #[arg(long, default_value = "cli")]
        session: String,

        /// Models to use, in fallback order
        #[arg(long = "model", value_name = "MODEL")]
        models: Vec<String>,

        /// Prompt text
        prompt: String,
    },
}
