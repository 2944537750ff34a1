//! acp-relay terminal host
//!
//! Lists detected agents and runs single-prompt sessions, asking on stdin for
//! every permission the agent requests.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use acp_relay_core::acp::CredentialDescriptor;
use acp_relay_core::{
    BackendDetector, BackendRegistry, ContentBlock, EventPayload, OpenOptions, PermissionOptionKind,
    PermissionRequest, RelayConfig, Session, SessionEvent, SessionManager, SessionUpdate,
    Workspace,
};
use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "acp_relay=debug,acp_relay_core=debug"
    } else {
        "acp_relay=info,acp_relay_core=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("acp-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => RelayConfig::load(path),
        None => RelayConfig::load_default(),
    }
    .context("Failed to load configuration")?;

    let mut registry = BackendRegistry::with_builtins();
    config.apply_to(&mut registry);
    let detector = Arc::new(BackendDetector::with_path_probe(
        Arc::new(registry),
        config.probe_timeout(),
    ));

    match cli.command {
        Commands::Agents { json } => list_agents(&detector, json).await,
        Commands::Chat {
            backend,
            workspace,
            session,
            models,
            prompt,
        } => {
            let manager = SessionManager::new(detector, config);
            chat(&manager, &backend, workspace, &session, models, prompt).await
        }
    }
}

async fn list_agents(detector: &BackendDetector, json: bool) -> anyhow::Result<()> {
    let agents = detector.list_detected_agents().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No agents detected");
        return Ok(());
    }
    for agent in agents {
        match agent.path {
            Some(path) => println!("{:<14} {:<24} {}", agent.backend_id, agent.display_name, path.display()),
            None => println!("{:<14} {}", agent.backend_id, agent.display_name),
        }
    }
    Ok(())
}

async fn chat(
    manager: &SessionManager,
    backend: &str,
    workspace: Option<PathBuf>,
    session_id: &str,
    models: Vec<String>,
    prompt: String,
) -> anyhow::Result<()> {
    let workspace = workspace
        .map(Workspace::open)
        .transpose()
        .context("Invalid workspace")?;
    let credentials = models
        .into_iter()
        .map(|model| CredentialDescriptor::model(model.clone(), model))
        .collect();

    let session = manager
        .open(backend, session_id, OpenOptions { workspace, credentials })
        .await
        .with_context(|| format!("Failed to open a session on {}", backend))?;
    let events = session.subscribe()?;
    let printer = tokio::spawn(print_events(Arc::clone(&session), events));

    let outcome = session.prompt(vec![ContentBlock::text(prompt)]).await;

    manager.close(session_id).await?;
    if let Err(e) = printer.await {
        warn!("Event printer stopped abnormally: {}", e);
    }

    let stop = outcome?;
    println!();
    println!("[{:?}]", stop);
    Ok(())
}

/// Stream updates to stdout until the session closes
async fn print_events(session: Arc<Session>, mut events: mpsc::Receiver<SessionEvent>) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = events.recv().await {
        match event.payload {
            EventPayload::Update(SessionUpdate::AgentMessageChunk { content }) => {
                if let Some(text) = content.as_text() {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
            }
            EventPayload::Update(SessionUpdate::ToolCall(call)) => {
                eprintln!("\n[tool] {} ({:?})", call.title, call.kind);
            }
            EventPayload::Update(SessionUpdate::Plan { entries }) => {
                for entry in entries {
                    eprintln!("[plan] {:?} {}", entry.status, entry.content);
                }
            }
            EventPayload::Update(_) => {}
            EventPayload::ToolCall(call) => {
                eprintln!("[tool] {} -> {:?}", call.title, call.status);
            }
            EventPayload::PermissionRequested(request) => {
                ask_permission(&session, &request, &mut stdin).await;
            }
            EventPayload::Terminated(error) => {
                eprintln!("\nSession ended: {}", error);
            }
        }
    }
}

async fn ask_permission(session: &Session, request: &PermissionRequest, stdin: &mut Lines<BufReader<Stdin>>) {
    eprintln!("\nPermission requested: {}", request.tool_call.title);
    for (i, option) in request.options.iter().enumerate() {
        eprintln!("  {}) {}", i + 1, option.name);
    }
    eprint!("> ");

    let line = stdin.next_line().await.ok().flatten();
    let chosen = line
        .and_then(|l| l.trim().parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| request.options.get(i));

    // Anything unrecognised counts as a one-time rejection
    let chosen = chosen.or_else(|| {
        request
            .options
            .iter()
            .find(|o| o.kind == PermissionOptionKind::RejectOnce)
    });

    let result = match chosen {
        Some(option) => session
            .resolve_permission(&request.id, &option.option_id)
            .map(|_| ()),
        None => session.cancel_tool_call(&request.tool_call.id).await.map(|_| ()),
    };
    if let Err(e) = result {
        warn!("Could not answer permission request {}: {}", request.id, e);
    }
}
