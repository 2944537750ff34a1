//! Built-in baseline agent
//!
//! Speaks ACP in-process over a duplex pipe, so the baseline backend works
//! with no external binary installed. Replies come from a [`PromptResponder`].

use crate::acp::{
    decode_envelope, Envelope, Transport, METHOD_INITIALIZE, METHOD_SESSION_CANCEL,
    METHOD_SESSION_NEW, METHOD_SESSION_PROMPT, METHOD_SESSION_SET_MODEL, METHOD_SESSION_UPDATE,
};
use crate::error::AcpError;
use crate::types::{
    error_codes, ContentBlock, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, SessionPromptParams, SessionUpdate, SessionUpdateNotification, StopReason,
    ACP_PROTOCOL_VERSION, JSONRPC_VERSION,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Produces the message chunks answering a prompt
#[async_trait]
pub trait PromptResponder: Send + Sync {
    async fn respond(
        &self,
        model: Option<&str>,
        prompt: &[ContentBlock],
    ) -> Result<Vec<String>, AcpError>;
}

/// Repeats the prompt text back
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoResponder;

#[async_trait]
impl PromptResponder for EchoResponder {
    async fn respond(
        &self,
        _model: Option<&str>,
        prompt: &[ContentBlock],
    ) -> Result<Vec<String>, AcpError> {
        let text: Vec<&str> = prompt.iter().filter_map(ContentBlock::as_text).collect();
        Ok(vec![format!("Echo: {}", text.join(" "))])
    }
}

#[derive(Default)]
struct LocalState {
    sessions: HashSet<String>,
    model: Option<String>,
}

pub struct LocalAgent {
    responder: Arc<dyn PromptResponder>,
    state: Mutex<LocalState>,
}

impl LocalAgent {
    pub fn new(responder: Arc<dyn PromptResponder>) -> Self {
        Self {
            responder,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Start serving. Returns the client end and the agent task.
    pub fn spawn(self, max_frame_bytes: usize) -> (Transport, JoinHandle<()>) {
        let (client_io, agent_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (agent_read, agent_write) = tokio::io::split(agent_io);

        let client = Transport::from_io(client_read, client_write, max_frame_bytes);
        let agent = Transport::from_io(agent_read, agent_write, max_frame_bytes);
        let task = tokio::spawn(self.serve(agent));
        (client, task)
    }

    async fn serve(self, transport: Transport) {
        info!("Local agent started");
        while let Some(frame) = transport.recv_frame().await {
            match decode_envelope(&frame) {
                Ok(Envelope::Request(request)) => {
                    let response = self.handle_request(&transport, request).await;
                    if let Err(e) = transport.send(&response.into()).await {
                        warn!("Local agent failed to reply: {}", e);
                        break;
                    }
                }
                Ok(Envelope::Notification(notification)) => {
                    if notification.method == METHOD_SESSION_CANCEL {
                        debug!("Local agent: cancel requested");
                    }
                }
                Ok(Envelope::Response(response)) => {
                    debug!("Local agent ignoring response {}", response.id);
                }
                Err(e) => warn!("Local agent dropping frame: {}", e),
            }
        }
        debug!("Local agent stopped");
    }

    async fn handle_request(&self, transport: &Transport, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            METHOD_INITIALIZE => JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": ACP_PROTOCOL_VERSION,
                    "agentCapabilities": { "loadSession": false },
                    "authMethods": []
                }),
            ),
            METHOD_SESSION_NEW => {
                let session_id = uuid::Uuid::new_v4().to_string();
                self.state.lock().sessions.insert(session_id.clone());
                JsonRpcResponse::success(id, serde_json::json!({ "sessionId": session_id }))
            }
            METHOD_SESSION_SET_MODEL => match params.get("modelId").and_then(Value::as_str) {
                Some(model) => {
                    info!("Local agent switched to model {}", model);
                    self.state.lock().model = Some(model.to_string());
                    JsonRpcResponse::success(id, serde_json::json!({}))
                }
                None => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, "Missing modelId"),
            },
            METHOD_SESSION_PROMPT => match serde_json::from_value::<SessionPromptParams>(params) {
                Ok(p) => self.prompt(transport, id, p).await,
                Err(e) => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, e.to_string()),
            },
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        }
    }

    async fn prompt(&self, transport: &Transport, id: Value, params: SessionPromptParams) -> JsonRpcResponse {
        let model = {
            let state = self.state.lock();
            if !state.sessions.contains(&params.session_id) {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Session not found: {}", params.session_id),
                );
            }
            state.model.clone()
        };

        let chunks = match self.responder.respond(model.as_deref(), &params.prompt).await {
            Ok(chunks) => chunks,
            Err(e) => return error_response(id, &e),
        };

        for chunk in chunks {
            let update = SessionUpdateNotification {
                session_id: params.session_id.clone(),
                update: SessionUpdate::AgentMessageChunk {
                    content: ContentBlock::text(chunk),
                },
            };
            let notification =
                JsonRpcNotification::new(METHOD_SESSION_UPDATE, Some(serde_json::json!(update)));
            if let Err(e) = transport.send(&notification.into()).await {
                return error_response(id, &e);
            }
        }

        JsonRpcResponse::success(id, serde_json::json!({ "stopReason": StopReason::EndTurn }))
    }
}

/// Error response carrying the classified kind, so the client need not guess
fn error_response(id: Value, error: &AcpError) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code: error_codes::INTERNAL_ERROR,
            message: error.message.clone(),
            data: Some(serde_json::json!({ "kind": error.kind, "retryable": error.retryable })),
        }),
    }
}
