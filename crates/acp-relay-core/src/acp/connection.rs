//! ACP connection
//!
//! Owns one agent process (or in-process agent task), correlates requests
//! with responses, and routes agent-initiated traffic to an [`AgentClient`].

use super::protocol::{
    decode, AcpMessage, AgentNotification, ProtocolHandler, METHOD_FS_READ_TEXT_FILE,
    METHOD_FS_WRITE_TEXT_FILE, METHOD_INITIALIZE, METHOD_REQUEST_PERMISSION,
    METHOD_SESSION_NEW, METHOD_SESSION_PROMPT, METHOD_SESSION_SET_MODEL,
};
use super::retry::{classify, RawFailure};
use super::traits::AgentClient;
use super::transport::Transport;
use crate::error::AcpError;
use crate::types::{
    error_codes, ClientCapabilities, ContentBlock, FsReadTextFileParams, FsWriteTextFileParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PromptResponse,
    RequestPermissionParams, RequestPermissionResponse, SessionNewResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type ResponseSender = oneshot::Sender<Result<JsonRpcResponse, AcpError>>;
type PendingRequests = Arc<Mutex<HashMap<u64, ResponseSender>>>;

/// Whatever runs the agent side of a connection
pub enum AgentProcess {
    Child(Child),
    InProcess(JoinHandle<()>),
}

impl AgentProcess {
    async fn terminate(self) {
        match self {
            Self::Child(mut child) => {
                if let Err(e) = child.kill().await {
                    debug!("Agent process already gone: {}", e);
                }
            }
            Self::InProcess(task) => task.abort(),
        }
    }
}

/// Connection to one agent
pub struct AcpConnection {
    name: String,
    protocol: ProtocolHandler,
    transport: Arc<Transport>,
    process: tokio::sync::Mutex<Option<AgentProcess>>,
    pending_requests: PendingRequests,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    message_task: JoinHandle<()>,
}

impl AcpConnection {
    /// Wrap a started agent and begin processing its output
    pub fn new(
        name: impl Into<String>,
        transport: Transport,
        process: AgentProcess,
        client: Arc<dyn AgentClient>,
        request_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let transport = Arc::new(transport);
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let message_task = tokio::spawn(Self::message_loop(
            name.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending_requests),
            Arc::clone(&closed),
            client,
        ));

        Self {
            name,
            protocol: ProtocolHandler::new(),
            transport,
            process: tokio::sync::Mutex::new(Some(process)),
            pending_requests,
            closed,
            request_timeout,
            message_task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests sent and not yet answered
    pub fn pending_count(&self) -> usize {
        self.pending_requests.lock().len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn initialize(
        &self,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, AcpError> {
        info!("Initializing ACP connection for {}", self.name);
        let result = self
            .request(
                METHOD_INITIALIZE,
                ProtocolHandler::initialize_params(capabilities),
                self.request_timeout,
            )
            .await?;
        ProtocolHandler::parse_value(result)
    }

    /// `session/new`, returning the agent's session id
    pub async fn new_session(&self, cwd: String) -> Result<String, AcpError> {
        let result = self
            .request(
                METHOD_SESSION_NEW,
                ProtocolHandler::session_new_params(cwd),
                self.request_timeout,
            )
            .await?;
        let created: SessionNewResult = ProtocolHandler::parse_value(result)?;
        info!("Agent {} created session {}", self.name, created.session_id);
        Ok(created.session_id)
    }

    pub async fn prompt(
        &self,
        session_id: &str,
        prompt: Vec<ContentBlock>,
        timeout: Duration,
    ) -> Result<PromptResponse, AcpError> {
        let result = self
            .request(
                METHOD_SESSION_PROMPT,
                ProtocolHandler::session_prompt_params(session_id.to_string(), prompt),
                timeout,
            )
            .await?;
        ProtocolHandler::parse_value(result)
    }

    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<(), AcpError> {
        self.request(
            METHOD_SESSION_SET_MODEL,
            ProtocolHandler::session_set_model_params(session_id, model_id),
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    /// `session/cancel` notification
    pub async fn cancel(&self, session_id: &str) -> Result<(), AcpError> {
        self.notify(ProtocolHandler::session_cancel(session_id)).await
    }

    pub async fn notify(&self, notification: JsonRpcNotification) -> Result<(), AcpError> {
        if self.is_closed() {
            return Err(AcpError::connection_not_ready("Connection closed"));
        }
        self.transport.send(&notification.into()).await
    }

    /// Send a request and wait for its result.
    ///
    /// JSON-RPC errors come back classified; no response within `timeout`
    /// yields a retryable `TIMEOUT`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AcpError> {
        if self.is_closed() {
            return Err(AcpError::connection_not_ready("Connection closed"));
        }

        let request = self.protocol.request(method, Some(params));
        let request_id = request.id.as_u64().unwrap_or_default();
        let (tx, rx) = oneshot::channel();

        self.pending_requests.lock().insert(request_id, tx);
        // Lost the race with close(): nobody will drain this entry
        if self.is_closed() {
            self.pending_requests.lock().remove(&request_id);
            return Err(AcpError::connection_not_ready("Connection closed"));
        }

        debug!("Sending request {} method={}", request_id, method);
        if let Err(e) = self.transport.send(&request.into()).await {
            self.pending_requests.lock().remove(&request_id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => {
                return Err(classify(RawFailure::Disconnected(
                    "Response channel closed".to_string(),
                )))
            }
            Err(_) => {
                self.pending_requests.lock().remove(&request_id);
                return Err(classify(RawFailure::Timeout(format!(
                    "No response to {} within {}ms",
                    method,
                    timeout.as_millis()
                ))));
            }
        };

        match response.error {
            Some(error) => Err(classify(RawFailure::Rpc(error))),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Close the connection. Outstanding requests fail with
    /// `CONNECTION_NOT_READY`; the agent is terminated. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing connection to {}", self.name);

        Self::drain_pending(&self.pending_requests, "Connection closed");
        self.message_task.abort();
        self.transport.shutdown();

        if let Some(process) = self.process.lock().await.take() {
            process.terminate().await;
        }
    }

    fn drain_pending(pending: &PendingRequests, reason: &str) {
        let drained: Vec<(u64, ResponseSender)> = pending.lock().drain().collect();
        for (id, tx) in drained {
            debug!("Failing pending request {}: {}", id, reason);
            let _ = tx.send(Err(AcpError::connection_not_ready(reason)));
        }
    }

    async fn message_loop(
        name: String,
        transport: Arc<Transport>,
        pending_requests: PendingRequests,
        closed: Arc<AtomicBool>,
        client: Arc<dyn AgentClient>,
    ) {
        while let Some(frame) = transport.recv_frame().await {
            match decode(&frame) {
                Ok(AcpMessage::Response(response)) => {
                    let Some(id) = response.id.as_u64() else {
                        warn!("Discarding response with non-numeric id: {}", response.id);
                        continue;
                    };
                    let sender = pending_requests.lock().remove(&id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(Ok(response));
                        }
                        None => warn!("Discarding response for unknown request: {}", id),
                    }
                }
                Ok(AcpMessage::Notification(AgentNotification::SessionUpdate(notification))) => {
                    debug!(
                        "Session update for {}: {}",
                        notification.session_id,
                        notification.update.kind()
                    );
                    client.on_session_update(notification).await;
                }
                Ok(AcpMessage::AgentRequest(request)) => {
                    debug!("Agent request: {}", request.method);
                    let client = Arc::clone(&client);
                    let transport = Arc::clone(&transport);
                    // Permission requests can wait on the user; keep reading meanwhile
                    tokio::spawn(async move {
                        let response = Self::handle_agent_request(client.as_ref(), request).await;
                        if let Err(e) = transport.send(&response.into()).await {
                            error!("Failed to send response: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Dropping undecodable frame from {}: {}", name, e);
                }
            }
        }

        if !closed.load(Ordering::SeqCst) {
            warn!("Agent {} closed its output", name);
            let error = classify(RawFailure::Disconnected(format!(
                "Agent {} exited",
                name
            )));
            Self::drain_pending(&pending_requests, &error.message);
            client.on_disconnect(error).await;
        }
    }

    async fn handle_agent_request(client: &dyn AgentClient, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            METHOD_FS_READ_TEXT_FILE => match serde_json::from_value::<FsReadTextFileParams>(params) {
                Ok(p) => match client.read_text_file(p).await {
                    Ok(content) => JsonRpcResponse::success(id, serde_json::json!({ "content": content })),
                    Err(e) => JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, e.to_string()),
                },
                Err(e) => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, e.to_string()),
            },
            METHOD_FS_WRITE_TEXT_FILE => {
                match serde_json::from_value::<FsWriteTextFileParams>(params) {
                    Ok(p) => match client.write_text_file(p).await {
                        Ok(()) => JsonRpcResponse::success(id, Value::Null),
                        Err(e) => {
                            JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, e.to_string())
                        }
                    },
                    Err(e) => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, e.to_string()),
                }
            }
            METHOD_REQUEST_PERMISSION => {
                match serde_json::from_value::<RequestPermissionParams>(params) {
                    Ok(p) => {
                        let outcome = client.request_permission(p).await;
                        JsonRpcResponse::success(
                            id,
                            serde_json::json!(RequestPermissionResponse { outcome }),
                        )
                    }
                    Err(e) => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, e.to_string()),
                }
            }
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Unsupported method: {}", other),
            ),
        }
    }
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        self.message_task.abort();
    }
}
