//! Session management
//!
//! A [`Session`] binds one caller-chosen id to one running agent: the
//! connection, the update dispatcher, the tool call tracker and the
//! permission broker. [`SessionManager`] opens sessions against the backend
//! registry and keeps them addressable by id.

use super::client_delegate::AgentClientDelegate;
use super::connection::{AcpConnection, AgentProcess};
use super::dispatcher::{EventPayload, SessionEvent, UpdateDispatcher};
use super::permissions::PermissionBroker;
use super::protocol::{ProtocolHandler, METHOD_SESSION_PROMPT};
use super::retry::{CredentialDescriptor, CredentialPool, RetryPolicy};
use super::tool_calls::ToolCallTracker;
use super::transport::Transport;
use crate::agent::{BackendDetector, BackendRegistry, EchoResponder, LocalAgent, PromptResponder};
use crate::config::RelayConfig;
use crate::error::{AcpError, AcpErrorKind, AgentError, Result};
use crate::sandbox::Workspace;
use crate::types::{
    BackendConfig, ClientCapabilities, ContentBlock, DetectedAgent, FileSystemCapability,
    LaunchCommand, PermissionOption, PermissionRequest, PromptResponse, SessionState, StopReason,
    ToolCall,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Caller-supplied resources for a new session
#[derive(Default)]
pub struct OpenOptions {
    /// Directory agent file requests are confined to
    pub workspace: Option<Workspace>,
    /// Rotation candidates, first one active
    pub credentials: Vec<CredentialDescriptor>,
}

/// Starts the agent side of a session under a launch environment
trait AgentLauncher: Send + Sync {
    fn launch(
        &self,
        env: &HashMap<String, String>,
    ) -> std::result::Result<(Transport, AgentProcess), AcpError>;
}

/// How a registered backend gets started
enum Launch {
    InProcess {
        responder: Arc<dyn PromptResponder>,
        max_frame_bytes: usize,
    },
    Process {
        command: LaunchCommand,
        path: Option<PathBuf>,
        cwd: Option<PathBuf>,
        max_frame_bytes: usize,
    },
}

impl AgentLauncher for Launch {
    fn launch(
        &self,
        env: &HashMap<String, String>,
    ) -> std::result::Result<(Transport, AgentProcess), AcpError> {
        match self {
            Self::InProcess {
                responder,
                max_frame_bytes,
            } => {
                let (transport, task) = LocalAgent::new(Arc::clone(responder)).spawn(*max_frame_bytes);
                Ok((transport, AgentProcess::InProcess(task)))
            }
            Self::Process {
                command,
                path,
                cwd,
                max_frame_bytes,
            } => {
                let (transport, child) = Transport::spawn(
                    command,
                    path.as_deref(),
                    env,
                    cwd.as_deref(),
                    *max_frame_bytes,
                )?;
                Ok((transport, AgentProcess::Child(child)))
            }
        }
    }
}

/// One live conversation with one backend instance
pub struct Session {
    id: String,
    backend: BackendConfig,
    state: parking_lot::Mutex<SessionState>,
    terminated: AtomicBool,
    agent_session_id: parking_lot::Mutex<Option<String>>,
    /// Replaced when a credential change restarts the agent
    connection: parking_lot::RwLock<Option<Arc<AcpConnection>>>,
    launcher: Box<dyn AgentLauncher>,
    fatal_tx: mpsc::Sender<AcpError>,
    dispatcher: Arc<UpdateDispatcher>,
    tracker: Arc<ToolCallTracker>,
    broker: Arc<PermissionBroker>,
    workspace: Option<Workspace>,
    retry: RetryPolicy,
    credentials: Option<parking_lot::Mutex<CredentialPool>>,
    request_timeout: Duration,
    prompt_timeout: Duration,
}

impl Session {
    /// Launch the agent under the first credential and wire it in
    fn start(
        id: String,
        backend: BackendConfig,
        launcher: Box<dyn AgentLauncher>,
        options: OpenOptions,
        config: &RelayConfig,
    ) -> std::result::Result<Arc<Self>, AcpError> {
        let pool = (!options.credentials.is_empty()).then(|| CredentialPool::new(options.credentials));
        let launch_env = pool
            .as_ref()
            .and_then(|p| p.current())
            .map(|c| c.env.clone())
            .unwrap_or_default();

        let dispatcher = Arc::new(UpdateDispatcher::new(&id, config.update_buffer));
        let tracker = Arc::new(ToolCallTracker::new(&id));
        let broker = Arc::new(PermissionBroker::new(
            &id,
            Arc::clone(&dispatcher),
            config.permission_timeout(),
        ));
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let session = Arc::new(Self {
            id,
            backend,
            state: parking_lot::Mutex::new(SessionState::Starting),
            terminated: AtomicBool::new(false),
            agent_session_id: parking_lot::Mutex::new(None),
            connection: parking_lot::RwLock::new(None),
            launcher,
            fatal_tx,
            dispatcher,
            tracker,
            broker,
            workspace: options.workspace,
            retry: RetryPolicy::from(&config.retry),
            credentials: pool.map(parking_lot::Mutex::new),
            request_timeout: config.request_timeout(),
            prompt_timeout: config.prompt_timeout(),
        });

        let connection = session.connect(&launch_env)?;
        *session.connection.write() = Some(connection);

        // The agent going away ends the session
        let weak = Arc::downgrade(&session);
        tokio::spawn(async move {
            if let Some(error) = fatal_rx.recv().await {
                if let Some(session) = weak.upgrade() {
                    session.fail(error).await;
                }
            }
        });

        Ok(session)
    }

    /// Launch a fresh agent process and connect it to this session's
    /// tracker, broker and dispatcher
    fn connect(
        &self,
        env: &HashMap<String, String>,
    ) -> std::result::Result<Arc<AcpConnection>, AcpError> {
        let (transport, process) = self.launcher.launch(env)?;
        let delegate = Arc::new(AgentClientDelegate::new(
            &self.id,
            self.workspace.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.broker),
            Arc::clone(&self.dispatcher),
            self.fatal_tx.clone(),
        ));
        Ok(Arc::new(AcpConnection::new(
            self.backend.name.clone(),
            transport,
            process,
            delegate,
            self.request_timeout,
        )))
    }

    fn connection(&self) -> std::result::Result<Arc<AcpConnection>, AcpError> {
        self.connection.read().clone().ok_or_else(|| {
            AcpError::connection_not_ready(format!("Session {} has no agent", self.id))
        })
    }

    /// Handshake with the first agent; the session is active afterwards
    async fn handshake(&self) -> std::result::Result<(), AcpError> {
        let connection = self.connection()?;
        let agent_session_id = self.establish(&connection).await?;
        *self.agent_session_id.lock() = Some(agent_session_id);

        // Its environment was applied at launch
        let initial = self
            .credentials
            .as_ref()
            .and_then(|pool| pool.lock().current().cloned());
        if let Some(credential) = initial {
            self.select_model(&credential).await?;
        }

        let mut state = self.state.lock();
        if *state == SessionState::Starting {
            *state = SessionState::Active;
        }
        info!(session_id = %self.id, backend = %self.backend.id, "Session active");
        Ok(())
    }

    /// `initialize` then `session/new`, returning the agent's session id
    async fn establish(&self, connection: &AcpConnection) -> std::result::Result<String, AcpError> {
        let fs = self.workspace.is_some();
        let capabilities = ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: fs,
                write_text_file: fs,
            },
            terminal: false,
        };
        let stopped = || !self.state().is_open();

        let init = self
            .retry
            .run_until(
                "initialize",
                || connection.initialize(capabilities.clone()),
                &stopped,
            )
            .await?;
        debug!(
            session_id = %self.id,
            "Agent speaks protocol version {}", init.protocol_version
        );

        let cwd = match &self.workspace {
            Some(workspace) => workspace.root().to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| AcpError::unknown(format!("No working directory: {}", e)))?,
        };
        let cwd = cwd.display().to_string();
        self.retry
            .run_until(
                "session/new",
                || connection.new_session(cwd.clone()),
                &stopped,
            )
            .await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Id the agent assigned in `session/new`
    pub fn agent_session_id(&self) -> Option<String> {
        self.agent_session_id.lock().clone()
    }

    /// Label of the credential currently in use
    pub fn active_credential(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .and_then(|pool| pool.lock().current().map(|c| c.label.clone()))
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    fn ensure_open(&self) -> std::result::Result<String, AcpError> {
        if !self.state().is_open() {
            return Err(AcpError::connection_not_ready(format!(
                "Session {} is closed",
                self.id
            )));
        }
        self.agent_session_id().ok_or_else(|| {
            AcpError::connection_not_ready(format!("Session {} has not started", self.id))
        })
    }

    pub fn subscribe(&self) -> std::result::Result<mpsc::Receiver<SessionEvent>, AcpError> {
        self.dispatcher.subscribe()
    }

    pub fn subscribe_with<F>(&self, handler: F) -> std::result::Result<JoinHandle<()>, AcpError>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.dispatcher.subscribe_with(handler)
    }

    /// Send a request to the agent.
    ///
    /// Retryable failures are retried with backoff; with a credential pool,
    /// exhausted retries and authentication failures rotate to the next
    /// credential. A session-fatal outcome terminates the session.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> std::result::Result<Value, AcpError> {
        self.ensure_open()?;
        self.send_with_recovery(method, |_| params.clone(), timeout)
            .await
    }

    /// Retry, rotation and termination around one request. `params` is
    /// rebuilt on every attempt from the agent's current session id, which
    /// changes when the agent is restarted.
    async fn send_with_recovery<P>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> std::result::Result<Value, AcpError>
    where
        P: Fn(&str) -> Value,
    {
        let stopped = || !self.state().is_open();
        let timed_out = AtomicBool::new(false);
        let op = || {
            let connection = self.connection();
            let agent_session_id = self.agent_session_id().unwrap_or_default();
            let payload = params(&agent_session_id);
            let timed_out = &timed_out;
            async move {
                let connection = connection?;
                // The turn that timed out may still be running
                if method == METHOD_SESSION_PROMPT && timed_out.swap(false, Ordering::SeqCst) {
                    debug!("Cancelling timed out turn of {} before retrying", agent_session_id);
                    if let Err(e) = connection.cancel(&agent_session_id).await {
                        debug!("Cancel before retry failed: {}", e);
                    }
                }
                let result = connection.request(method, payload, timeout).await;
                if result
                    .as_ref()
                    .is_err_and(|e| e.kind == AcpErrorKind::Timeout)
                {
                    timed_out.store(true, Ordering::SeqCst);
                }
                result
            }
        };

        let result = match &self.credentials {
            Some(pool) => {
                self.retry
                    .run_with_rotation(
                        method,
                        pool,
                        op,
                        |credential| self.switch_credential(credential),
                        stopped,
                    )
                    .await
            }
            None => self.retry.run_until(method, op, stopped).await,
        };

        if let Err(error) = &result {
            if self.state().is_open() && (error.retryable || error.is_session_fatal()) {
                self.fail(error.clone()).await;
            }
        }
        result
    }

    /// Run one prompt turn to completion
    pub async fn prompt(
        &self,
        content: Vec<ContentBlock>,
    ) -> std::result::Result<StopReason, AcpError> {
        self.ensure_open()?;
        debug!(session_id = %self.id, "Prompting with {} blocks", content.len());

        let result = self
            .send_with_recovery(
                METHOD_SESSION_PROMPT,
                |agent_session_id| {
                    ProtocolHandler::session_prompt_params(agent_session_id.to_string(), content.clone())
                },
                self.prompt_timeout,
            )
            .await?;
        let response: PromptResponse = ProtocolHandler::parse_value(result)?;
        info!(session_id = %self.id, "Turn ended: {:?}", response.stop_reason);
        Ok(response.stop_reason)
    }

    /// Ask the agent to stop the current turn. Open permission prompts
    /// resolve as cancelled.
    pub async fn cancel_turn(&self) -> std::result::Result<(), AcpError> {
        let agent_session_id = self.ensure_open()?;
        info!(session_id = %self.id, "Cancelling turn");
        self.broker
            .cancel_all(AcpError::unknown("Turn cancelled by caller"));
        self.connection()?.cancel(&agent_session_id).await
    }

    /// Move the agent onto `credential`. A launch environment only takes
    /// effect in a new process, so an environment change restarts the agent.
    async fn switch_credential(
        &self,
        credential: CredentialDescriptor,
    ) -> std::result::Result<(), AcpError> {
        if !credential.env.is_empty() {
            self.restart(&credential).await?;
        }
        self.select_model(&credential).await
    }

    /// Switch model on the agent side
    async fn select_model(
        &self,
        credential: &CredentialDescriptor,
    ) -> std::result::Result<(), AcpError> {
        let Some(model) = &credential.model else {
            return Ok(());
        };
        let agent_session_id = self.agent_session_id().ok_or_else(|| {
            AcpError::connection_not_ready(format!("Session {} has not started", self.id))
        })?;
        info!(session_id = %self.id, "Using credential {} ({})", credential.label, model);
        self.connection()?.set_model(&agent_session_id, model).await
    }

    /// Replace the agent with one launched under `credential`'s environment.
    /// The old process is only stopped once the new one has a session.
    async fn restart(&self, credential: &CredentialDescriptor) -> std::result::Result<(), AcpError> {
        info!(
            session_id = %self.id,
            "Restarting agent for credential {}", credential.label
        );
        let connection = self.connect(&credential.env)?;
        let agent_session_id = match self.establish(&connection).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session_id = %self.id, "Restarted agent failed to start: {}", e);
                connection.close().await;
                return Err(e);
            }
        };

        let previous = self.connection.write().replace(Arc::clone(&connection));
        *self.agent_session_id.lock() = Some(agent_session_id);
        // Prompts raised by the old process can no longer be answered
        self.broker
            .cancel_all(AcpError::connection_not_ready("Agent restarted"));
        if let Some(previous) = previous {
            previous.close().await;
        }

        // Lost the race with close(): it saw the old connection only
        if !self.state().is_open() {
            connection.close().await;
        }
        Ok(())
    }

    pub fn resolve_permission(&self, request_id: &str, option_id: &str) -> Result<PermissionOption> {
        Ok(self.broker.resolve(request_id, option_id)?)
    }

    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        self.broker.pending()
    }

    /// Fail one tool call without ending the session. Its open permission
    /// prompt, if any, is answered as cancelled.
    pub async fn cancel_tool_call(&self, tool_call_id: &str) -> Result<ToolCall> {
        if self.tracker.get(tool_call_id).is_none() {
            return Err(AgentError::ToolCallNotFound(tool_call_id.to_string()).into());
        }

        let error = AcpError::unknown("Cancelled by caller");
        if self.broker.cancel_tool_call(tool_call_id, error.clone()) {
            debug!(session_id = %self.id, "Withdrew permission prompt for {}", tool_call_id);
        }
        if let Some(changed) = self.tracker.fail(tool_call_id, error) {
            self.dispatcher
                .dispatch(EventPayload::ToolCall(changed))
                .await;
        }

        self.tracker
            .get(tool_call_id)
            .ok_or_else(|| AgentError::ToolCallNotFound(tool_call_id.to_string()).into())
    }

    pub fn tool_call(&self, tool_call_id: &str) -> Option<ToolCall> {
        self.tracker.get(tool_call_id)
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tracker.all()
    }

    /// Tear the session down. Outstanding requests and permission prompts
    /// fail with `CONNECTION_NOT_READY`. Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if !state.is_open() {
                return;
            }
            *state = SessionState::Closing;
        }
        info!(session_id = %self.id, "Closing session");

        let reason = AcpError::connection_not_ready(format!("Session {} closed", self.id));
        self.broker.close(reason);
        let connection = self.connection.read().clone();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.dispatcher.close();

        *self.state.lock() = SessionState::Closed;
        debug!(session_id = %self.id, "Session closed");
    }

    /// Report a terminal error to subscribers, then close
    async fn fail(&self, error: AcpError) {
        if !self.state().is_open() || self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %self.id, "Session terminated: {}", error);
        self.dispatcher
            .dispatch(EventPayload::Terminated(error))
            .await;
        self.close().await;
    }
}

/// Listing entry for an open or finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub backend_id: String,
    pub state: SessionState,
}

/// Opens sessions against the backend registry and tracks them by id
pub struct SessionManager {
    detector: Arc<BackendDetector>,
    config: RelayConfig,
    responder: Arc<dyn PromptResponder>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(detector: Arc<BackendDetector>, config: RelayConfig) -> Self {
        Self {
            detector,
            config,
            responder: Arc::new(EchoResponder),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the reply source of the built-in backend
    pub fn with_responder(mut self, responder: Arc<dyn PromptResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        self.detector.registry()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn list_detected_agents(&self) -> Vec<DetectedAgent> {
        self.detector.list_detected_agents().await
    }

    /// Start the backend and complete the handshake.
    ///
    /// `session_id` must not name a session that is still open.
    pub async fn open(
        &self,
        backend_id: &str,
        session_id: impl Into<String>,
        options: OpenOptions,
    ) -> Result<Arc<Session>> {
        let session_id = session_id.into();
        let backend = self
            .registry()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(backend_id.to_string()))?;
        if !backend.enabled {
            return Err(AgentError::Disabled(backend_id.to_string()).into());
        }
        // Rotating to a credential must change something on the agent side
        if let Some(idle) = options
            .credentials
            .iter()
            .find(|c| c.model.is_none() && c.env.is_empty())
        {
            return Err(AgentError::InvalidCredential(idle.label.clone()).into());
        }

        let max_frame_bytes = self.config.max_frame_bytes;
        let launch = match &backend.command {
            None => Launch::InProcess {
                responder: Arc::clone(&self.responder),
                max_frame_bytes,
            },
            Some(command) => {
                let path = match self.detector.find(&backend.id).await {
                    Some(agent) => agent.path,
                    None => backend.default_path.clone(),
                };
                Launch::Process {
                    command: command.clone(),
                    path,
                    cwd: options.workspace.as_ref().map(|w| w.root().to_path_buf()),
                    max_frame_bytes,
                }
            }
        };

        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.get(&session_id).is_some_and(|s| s.state().is_open()) {
                return Err(AgentError::SessionAlreadyExists(session_id).into());
            }
            info!(session_id = %session_id, "Opening session on {}", backend.name);
            let session = Session::start(
                session_id.clone(),
                backend,
                Box::new(launch),
                options,
                &self.config,
            )?;
            sessions.insert(session_id.clone(), Arc::clone(&session));
            session
        };

        if let Err(e) = session.handshake().await {
            warn!(session_id = %session_id, "Handshake failed: {}", e);
            session.close().await;
            self.sessions.write().await.remove(&session_id);
            return Err(e.into());
        }
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()).into())
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id().to_string(),
                backend_id: s.backend().id.clone(),
                state: s.state(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SessionEvent>> {
        Ok(self.get(session_id).await?.subscribe()?)
    }

    /// Raw request with the session's default timeout
    pub async fn send(&self, session_id: &str, method: &str, params: Value) -> Result<Value> {
        let session = self.get(session_id).await?;
        let timeout = session.request_timeout;
        Ok(session.request(method, params, timeout).await?)
    }

    pub async fn prompt(&self, session_id: &str, content: Vec<ContentBlock>) -> Result<StopReason> {
        Ok(self.get(session_id).await?.prompt(content).await?)
    }

    pub async fn resolve_permission(
        &self,
        session_id: &str,
        request_id: &str,
        option_id: &str,
    ) -> Result<PermissionOption> {
        self.get(session_id)
            .await?
            .resolve_permission(request_id, option_id)
    }

    pub async fn cancel_tool_call(&self, session_id: &str, tool_call_id: &str) -> Result<ToolCall> {
        self.get(session_id)
            .await?
            .cancel_tool_call(tool_call_id)
            .await
    }

    /// Close and forget a session
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        session.close().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::protocol::{
        decode_envelope, Envelope, METHOD_INITIALIZE, METHOD_REQUEST_PERMISSION,
        METHOD_SESSION_CANCEL, METHOD_SESSION_NEW, METHOD_SESSION_SET_MODEL,
        METHOD_SESSION_UPDATE,
    };
    use crate::agent::ExecutableProbe;
    use crate::error::{AcpErrorKind, Error};
    use crate::sandbox::SeedFile;
    use crate::types::{
        error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, SessionUpdate,
        ToolCallStatus,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    struct NothingInstalled;

    #[async_trait]
    impl ExecutableProbe for NothingInstalled {
        async fn locate(&self, _program: &str) -> Option<PathBuf> {
            None
        }
    }

    fn manager(registry: BackendRegistry) -> SessionManager {
        let detector = BackendDetector::new(
            Arc::new(registry),
            Arc::new(NothingInstalled),
            Duration::from_millis(100),
        );
        SessionManager::new(Arc::new(detector), RelayConfig::default())
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> EventPayload {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
            .payload
    }

    /// Agent behaviour for one scripted session
    #[derive(Default, Clone, Copy)]
    struct Script {
        ask_permission: bool,
        required_model: Option<&'static str>,
        /// `API_KEY` the agent must have been launched with
        required_key: Option<&'static str>,
        prompt_error: Option<&'static str>,
        /// Leave the first prompt unanswered until it is cancelled
        stall_first_prompt: bool,
    }

    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    async fn notify(transport: &Transport, update: Value) {
        let mut params = json!({ "sessionId": "agent-1" });
        params["update"] = update;
        transport
            .send(&JsonRpcNotification::new(METHOD_SESSION_UPDATE, Some(params)).into())
            .await
            .unwrap();
    }

    /// Announce a tool call, ask permission for it, and complete it if allowed
    async fn run_tool_call(transport: &Transport, turn: u32) {
        let tool_call_id = format!("t{}", turn);
        notify(
            transport,
            json!({
                "sessionUpdate": "tool_call",
                "toolCallId": tool_call_id,
                "title": "Run tests",
                "kind": "execute",
                "status": "pending"
            }),
        )
        .await;

        let permission_id = format!("perm-{}", turn);
        let ask = JsonRpcRequest::new(
            permission_id.clone(),
            METHOD_REQUEST_PERMISSION,
            Some(json!({
                "sessionId": "agent-1",
                "toolCall": { "toolCallId": tool_call_id },
                "options": [
                    { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                    { "optionId": "allow-always", "name": "Always allow", "kind": "allow_always" },
                    { "optionId": "reject", "name": "Reject", "kind": "reject_once" }
                ]
            })),
        );
        transport.send(&ask.into()).await.unwrap();

        let outcome = loop {
            let Some(frame) = transport.recv_frame().await else {
                return;
            };
            if let Ok(Envelope::Response(response)) = decode_envelope(&frame) {
                if response.id == json!(permission_id) {
                    break response.result.unwrap_or(Value::Null);
                }
            }
        };

        let allowed = outcome["outcome"]["outcome"] == "selected"
            && outcome["outcome"]["optionId"]
                .as_str()
                .is_some_and(|id| id.starts_with("allow"));
        if allowed {
            notify(
                transport,
                json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": tool_call_id,
                    "status": "completed"
                }),
            )
            .await;
        }
    }

    async fn scripted_agent(
        transport: Transport,
        script: Script,
        env: HashMap<String, String>,
        generation: usize,
        log: Log,
    ) {
        let mut model: Option<String> = None;
        let mut turn = 0;
        let mut stalled: Option<Value> = None;

        while let Some(frame) = transport.recv_frame().await {
            let request = match decode_envelope(&frame) {
                Ok(Envelope::Request(request)) => request,
                Ok(Envelope::Notification(n)) if n.method == METHOD_SESSION_CANCEL => {
                    log.lock().push(format!("{}:cancel", generation));
                    // Without a turn to stop, cancel makes this agent exit, simulating a crash
                    let Some(id) = stalled.take() else {
                        return;
                    };
                    let reply = JsonRpcResponse::success(id, json!({ "stopReason": "cancelled" }));
                    if transport.send(&reply.into()).await.is_err() {
                        return;
                    }
                    continue;
                }
                _ => continue,
            };
            let id = request.id.clone();
            let params = request.params.clone().unwrap_or(Value::Null);

            let reply = match request.method.as_str() {
                METHOD_INITIALIZE => JsonRpcResponse::success(id, json!({ "protocolVersion": 1 })),
                METHOD_SESSION_NEW => JsonRpcResponse::success(
                    id,
                    json!({ "sessionId": format!("agent-{}", generation) }),
                ),
                METHOD_SESSION_SET_MODEL => {
                    model = params["modelId"].as_str().map(str::to_string);
                    JsonRpcResponse::success(id, json!({}))
                }
                METHOD_SESSION_PROMPT => {
                    turn += 1;
                    log.lock().push(format!("{}:prompt", generation));
                    let key_ok = script
                        .required_key
                        .map_or(true, |key| env.get("API_KEY").map(String::as_str) == Some(key));
                    if script.stall_first_prompt && turn == 1 {
                        stalled = Some(id);
                        continue;
                    } else if !key_ok
                        || (script.required_model.is_some() && model.as_deref() != script.required_model)
                    {
                        JsonRpcResponse::failure(id, error_codes::AUTH_REQUIRED, "Authentication required")
                    } else if let Some(message) = script.prompt_error {
                        JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, message)
                    } else {
                        if script.ask_permission {
                            run_tool_call(&transport, turn).await;
                        }
                        JsonRpcResponse::success(id, json!({ "stopReason": "end_turn" }))
                    }
                }
                m if m.starts_with("slow/") => continue,
                other => JsonRpcResponse::failure(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", other),
                ),
            };
            if transport.send(&reply.into()).await.is_err() {
                return;
            }
        }
    }

    /// Starts a scripted agent over an in-memory pipe, recording each launch
    struct ScriptedLauncher {
        script: Script,
        launches: Arc<parking_lot::Mutex<Vec<HashMap<String, String>>>>,
        log: Log,
    }

    impl AgentLauncher for ScriptedLauncher {
        fn launch(
            &self,
            env: &HashMap<String, String>,
        ) -> std::result::Result<(Transport, AgentProcess), AcpError> {
            let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client_io);
            let (agent_read, agent_write) = tokio::io::split(agent_io);
            let agent = Transport::from_io(agent_read, agent_write, 1024 * 1024);

            let generation = {
                let mut launches = self.launches.lock();
                launches.push(env.clone());
                launches.len()
            };
            let task = tokio::spawn(scripted_agent(
                agent,
                self.script,
                env.clone(),
                generation,
                Arc::clone(&self.log),
            ));
            Ok((
                Transport::from_io(client_read, client_write, 1024 * 1024),
                AgentProcess::InProcess(task),
            ))
        }
    }

    struct Scripted {
        session: Arc<Session>,
        launches: Arc<parking_lot::Mutex<Vec<HashMap<String, String>>>>,
        log: Log,
    }

    fn fast_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.retry.base_delay_ms = 1;
        config
    }

    async fn scripted(script: Script, credentials: Vec<CredentialDescriptor>, config: RelayConfig) -> Scripted {
        let launches = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log: Log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let launcher = ScriptedLauncher {
            script,
            launches: Arc::clone(&launches),
            log: Arc::clone(&log),
        };

        let session = Session::start(
            "case-1".to_string(),
            BackendConfig::external("scripted", "Scripted", LaunchCommand::new("scripted", &[])),
            Box::new(launcher),
            OpenOptions {
                workspace: None,
                credentials,
            },
            &config,
        )
        .unwrap();
        session.handshake().await.unwrap();
        Scripted {
            session,
            launches,
            log,
        }
    }

    async fn scripted_session(script: Script, credentials: Vec<CredentialDescriptor>) -> Arc<Session> {
        scripted(script, credentials, fast_config()).await.session
    }

    fn api_key(key: &str) -> CredentialDescriptor {
        CredentialDescriptor {
            label: key.to_string(),
            model: None,
            env: HashMap::from([("API_KEY".to_string(), key.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_builtin_session_round_trip() {
        let manager = manager(BackendRegistry::with_builtins());
        let session = manager
            .open("builtin", "case-1", OpenOptions::default())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.agent_session_id().is_some());

        let mut events = manager.subscribe("case-1").await.unwrap();
        let stop = manager
            .prompt("case-1", vec![ContentBlock::text("hello")])
            .await
            .unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        match next_event(&mut events).await {
            EventPayload::Update(SessionUpdate::AgentMessageChunk { content }) => {
                assert_eq!(content.as_text(), Some("Echo: hello"));
            }
            other => panic!("Expected message chunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_rejects_bad_requests() {
        let mut registry = BackendRegistry::with_builtins();
        registry.set_enabled("goose", false);
        let manager = manager(registry);

        let missing = manager.open("nope", "s1", OpenOptions::default()).await;
        assert!(matches!(missing, Err(Error::Agent(AgentError::NotFound(_)))));

        let disabled = manager.open("goose", "s1", OpenOptions::default()).await;
        assert!(matches!(disabled, Err(Error::Agent(AgentError::Disabled(_)))));

        manager.open("builtin", "s1", OpenOptions::default()).await.unwrap();
        let duplicate = manager.open("builtin", "s1", OpenOptions::default()).await;
        assert!(matches!(
            duplicate,
            Err(Error::Agent(AgentError::SessionAlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let manager = manager(BackendRegistry::with_builtins());
        manager.open("builtin", "a", OpenOptions::default()).await.unwrap();
        manager.open("builtin", "b", OpenOptions::default()).await.unwrap();

        manager.close("a").await.unwrap();
        let stop = manager.prompt("b", vec![ContentBlock::text("still here")]).await.unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        assert_eq!(
            manager.list_sessions().await,
            vec![SessionSummary {
                id: "b".to_string(),
                backend_id: "builtin".to_string(),
                state: SessionState::Active,
            }]
        );
        assert!(matches!(
            manager.get("a").await,
            Err(Error::Agent(AgentError::SessionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let manager = manager(BackendRegistry::with_builtins());
        let session = manager.open("builtin", "s1", OpenOptions::default()).await.unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.prompt(vec![ContentBlock::text("hi")]).await.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::ConnectionNotReady);
        assert!(session.subscribe().is_err());
    }

    #[tokio::test]
    async fn test_workspace_seeded_before_open() {
        let dir = tempdir().unwrap();
        let workspace = Workspace::prepare(dir.path().join("case"), &[SeedFile::new("brief.md", "# Brief")])
            .await
            .unwrap();

        let manager = manager(BackendRegistry::with_builtins());
        let session = manager
            .open(
                "builtin",
                "s1",
                OpenOptions {
                    workspace: Some(workspace),
                    credentials: Vec::new(),
                },
            )
            .await
            .unwrap();

        let root = session.workspace().unwrap().root();
        assert!(root.join("brief.md").exists());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_open() {
        let mut registry = BackendRegistry::new(vec![]);
        registry.register(BackendConfig::external(
            "ghost",
            "Ghost",
            LaunchCommand::new("definitely-not-an-installed-agent-binary", &[]),
        ));
        let manager = manager(registry);

        let result = manager.open("ghost", "s1", OpenOptions::default()).await;
        assert!(matches!(result, Err(Error::Acp(_))));
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_once_keeps_session_active() {
        let session = scripted_session(
            Script {
                ask_permission: true,
                ..Default::default()
            },
            vec![],
        )
        .await;
        let mut events = session.subscribe().unwrap();

        let turn = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.prompt(vec![ContentBlock::text("run tests")]).await }
        });

        assert!(matches!(
            next_event(&mut events).await,
            EventPayload::Update(SessionUpdate::ToolCall(_))
        ));
        let EventPayload::PermissionRequested(request) = next_event(&mut events).await else {
            panic!("Expected a permission request");
        };
        assert_eq!(request.tool_call.id, "t1");
        session.resolve_permission(&request.id, "reject").unwrap();

        match next_event(&mut events).await {
            EventPayload::ToolCall(call) => {
                assert_eq!(call.status, ToolCallStatus::Failed);
                assert_eq!(call.error.unwrap().kind, AcpErrorKind::PermissionDenied);
            }
            other => panic!("Expected tool call change, got {:?}", other),
        }

        assert_eq!(turn.await.unwrap().unwrap(), StopReason::EndTurn);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.tool_call("t1").unwrap().status, ToolCallStatus::Failed);
    }

    #[tokio::test]
    async fn test_allow_always_suppresses_equivalent_prompt() {
        let session = scripted_session(
            Script {
                ask_permission: true,
                ..Default::default()
            },
            vec![],
        )
        .await;
        let mut events = session.subscribe().unwrap();

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.prompt(vec![ContentBlock::text("one")]).await }
        });
        let request = loop {
            if let EventPayload::PermissionRequested(request) = next_event(&mut events).await {
                break request;
            }
        };
        session.resolve_permission(&request.id, "allow-always").unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(session.tool_call("t1").unwrap().status, ToolCallStatus::Completed);
        while events.try_recv().is_ok() {}

        session.prompt(vec![ContentBlock::text("two")]).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.payload);
        }
        assert!(!seen
            .iter()
            .any(|p| matches!(p, EventPayload::PermissionRequested(_))));
        assert!(session.pending_permissions().is_empty());
        assert_eq!(session.tool_call("t2").unwrap().status, ToolCallStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_tool_call_answers_pending_prompt() {
        let session = scripted_session(
            Script {
                ask_permission: true,
                ..Default::default()
            },
            vec![],
        )
        .await;
        let mut events = session.subscribe().unwrap();

        let turn = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.prompt(vec![ContentBlock::text("go")]).await }
        });
        loop {
            if let EventPayload::PermissionRequested(_) = next_event(&mut events).await {
                break;
            }
        }

        let call = session.cancel_tool_call("t1").await.unwrap();
        assert_eq!(call.status, ToolCallStatus::Failed);
        assert_eq!(turn.await.unwrap().unwrap(), StopReason::EndTurn);
        assert_eq!(session.state(), SessionState::Active);

        let missing = session.cancel_tool_call("t9").await;
        assert!(matches!(missing, Err(Error::Agent(AgentError::ToolCallNotFound(_)))));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let session = scripted_session(Script::default(), vec![]).await;

        let a = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request("slow/a", json!({}), Duration::from_secs(30)).await }
        });
        let b = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request("slow/b", json!({}), Duration::from_secs(30)).await }
        });
        while session.connection().unwrap().pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        session.close().await;
        assert_eq!(a.await.unwrap().unwrap_err().kind, AcpErrorKind::ConnectionNotReady);
        assert_eq!(b.await.unwrap().unwrap_err().kind, AcpErrorKind::ConnectionNotReady);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_agent_exit_terminates_session() {
        let session = scripted_session(Script::default(), vec![]).await;
        let mut events = session.subscribe().unwrap();

        session.cancel_turn().await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            EventPayload::Terminated(_)
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.state() != SessionState::Closed {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_rotates_credentials() {
        let session = scripted_session(
            Script {
                required_model: Some("backup-model"),
                ..Default::default()
            },
            vec![
                CredentialDescriptor::model("primary", "primary-model"),
                CredentialDescriptor::model("backup", "backup-model"),
            ],
        )
        .await;
        assert_eq!(session.active_credential().as_deref(), Some("primary"));

        let stop = session.prompt(vec![ContentBlock::text("hi")]).await.unwrap();
        assert_eq!(stop, StopReason::EndTurn);
        assert_eq!(session.active_credential().as_deref(), Some("backup"));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_exhausted_credentials_are_fatal() {
        let session = scripted_session(
            Script {
                required_model: Some("other-model"),
                ..Default::default()
            },
            vec![CredentialDescriptor::model("primary", "primary-model")],
        )
        .await;
        let mut events = session.subscribe().unwrap();

        let err = session.prompt(vec![ContentBlock::text("hi")]).await.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::AuthenticationFailed);
        assert!(!err.retryable);

        match next_event(&mut events).await {
            EventPayload::Terminated(error) => {
                assert_eq!(error.kind, AcpErrorKind::AuthenticationFailed)
            }
            other => panic!("Expected termination, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_expired_session_is_fatal() {
        let session = scripted_session(
            Script {
                prompt_error: Some("Session not found: agent-1"),
                ..Default::default()
            },
            vec![],
        )
        .await;

        let err = session.prompt(vec![ContentBlock::text("hi")]).await.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::SessionExpired);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_errors_leave_session_open() {
        let session = scripted_session(
            Script {
                prompt_error: Some("Model refused the request"),
                ..Default::default()
            },
            vec![],
        )
        .await;

        let err = session.prompt(vec![ContentBlock::text("hi")]).await.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::Unknown);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_env_rotation_restarts_agent_with_new_environment() {
        let run = scripted(
            Script {
                required_key: Some("key-b"),
                ..Default::default()
            },
            vec![api_key("key-a"), api_key("key-b")],
            fast_config(),
        )
        .await;
        assert_eq!(run.session.agent_session_id().as_deref(), Some("agent-1"));

        let stop = run.session.prompt(vec![ContentBlock::text("hi")]).await.unwrap();
        assert_eq!(stop, StopReason::EndTurn);

        let keys: Vec<String> = run
            .launches
            .lock()
            .iter()
            .map(|env| env["API_KEY"].clone())
            .collect();
        assert_eq!(keys, vec!["key-a".to_string(), "key-b".to_string()]);
        assert_eq!(*run.log.lock(), vec!["1:prompt".to_string(), "2:prompt".to_string()]);
        assert_eq!(run.session.agent_session_id().as_deref(), Some("agent-2"));
        assert_eq!(run.session.active_credential().as_deref(), Some("key-b"));
        assert_eq!(run.session.state(), SessionState::Active);

        // The restarted agent keeps serving the session
        run.session.prompt(vec![ContentBlock::text("again")]).await.unwrap();
        assert_eq!(run.launches.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_open_rejects_credential_that_changes_nothing() {
        let manager = manager(BackendRegistry::with_builtins());
        let idle = CredentialDescriptor {
            label: "idle".to_string(),
            model: None,
            env: HashMap::new(),
        };

        let result = manager
            .open(
                "builtin",
                "s1",
                OpenOptions {
                    workspace: None,
                    credentials: vec![api_key("key-a"), idle],
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::Agent(AgentError::InvalidCredential(ref label))) if label == "idle"
        ));
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_prompt_is_cancelled_before_retry() {
        let mut config = fast_config();
        config.prompt_timeout_ms = 100;
        let run = scripted(
            Script {
                stall_first_prompt: true,
                ..Default::default()
            },
            vec![],
            config,
        )
        .await;

        let stop = run.session.prompt(vec![ContentBlock::text("hi")]).await.unwrap();
        assert_eq!(stop, StopReason::EndTurn);
        assert_eq!(
            *run.log.lock(),
            vec![
                "1:prompt".to_string(),
                "1:cancel".to_string(),
                "1:prompt".to_string()
            ]
        );
        assert_eq!(run.session.state(), SessionState::Active);
    }
}
