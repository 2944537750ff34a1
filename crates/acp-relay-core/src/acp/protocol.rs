//! ACP protocol codec
//!
//! Frames are newline-delimited JSON-RPC 2.0 objects. Decoding works on one
//! complete frame at a time; buffering partial input is the transport's job.

use super::retry::{classify, RawFailure};
use crate::error::AcpError;
use crate::types::{
    ClientCapabilities, ClientInfo, ContentBlock, InitializeParams, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, SessionNewParams, SessionPromptParams,
    SessionUpdateNotification, ACP_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
pub const METHOD_SESSION_SET_MODEL: &str = "session/set_model";
pub const METHOD_SESSION_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
pub const METHOD_FS_READ_TEXT_FILE: &str = "fs/read_text_file";
pub const METHOD_FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";

/// Outbound request builder with a per-connection id counter
pub struct ProtocolHandler {
    request_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_id: AtomicU64::new(1),
        }
    }

    /// Generate next request ID. Ids are never reused within a connection.
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn request(&self, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(self.next_id(), method, params)
    }

    pub fn initialize_params(capabilities: ClientCapabilities) -> Value {
        serde_json::json!(InitializeParams {
            protocol_version: ACP_PROTOCOL_VERSION,
            client_capabilities: capabilities,
            client_info: ClientInfo::default(),
        })
    }

    pub fn session_new_params(cwd: String) -> Value {
        serde_json::json!(SessionNewParams {
            cwd,
            mcp_servers: Vec::new(),
        })
    }

    pub fn session_prompt_params(session_id: String, prompt: Vec<ContentBlock>) -> Value {
        serde_json::json!(SessionPromptParams { session_id, prompt })
    }

    pub fn session_set_model_params(session_id: &str, model_id: &str) -> Value {
        serde_json::json!({ "sessionId": session_id, "modelId": model_id })
    }

    pub fn session_cancel(session_id: &str) -> JsonRpcNotification {
        JsonRpcNotification::new(
            METHOD_SESSION_CANCEL,
            Some(serde_json::json!({ "sessionId": session_id })),
        )
    }

    /// Typed result of a response, or the classified JSON-RPC error
    pub fn parse_result<T: DeserializeOwned>(response: JsonRpcResponse) -> Result<T, AcpError> {
        if let Some(error) = response.error {
            return Err(classify(RawFailure::Rpc(error)));
        }
        Self::parse_value(response.result.unwrap_or(Value::Null))
    }

    /// Typed view of a successful result
    pub fn parse_value<T: DeserializeOwned>(result: Value) -> Result<T, AcpError> {
        serde_json::from_value(result.clone()).map_err(|e| {
            AcpError::unknown(format!("Unexpected result shape: {}", e)).with_details(result)
        })
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// The three JSON-RPC envelope kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl From<JsonRpcRequest> for Envelope {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcResponse> for Envelope {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcNotification> for Envelope {
    fn from(notification: JsonRpcNotification) -> Self {
        Self::Notification(notification)
    }
}

/// Inbound message as seen by the client side
#[derive(Debug, Clone, PartialEq)]
pub enum AcpMessage {
    /// Response to one of our requests
    Response(JsonRpcResponse),
    /// Request from agent (fs/*, session/request_permission)
    AgentRequest(JsonRpcRequest),
    /// Notification with a recognised method
    Notification(AgentNotification),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentNotification {
    SessionUpdate(SessionUpdateNotification),
}

/// Serialize an envelope as one newline-terminated frame
pub fn encode(envelope: &Envelope) -> Result<String, AcpError> {
    let json = match envelope {
        Envelope::Request(r) => serde_json::to_string(r),
        Envelope::Response(r) => serde_json::to_string(r),
        Envelope::Notification(n) => serde_json::to_string(n),
    }
    .map_err(|e| AcpError::unknown(format!("Failed to encode message: {}", e)))?;

    let mut frame = json;
    frame.push('\n');
    Ok(frame)
}

/// Classify one frame by shape only, without interpreting the method
pub fn decode_envelope(frame: &str) -> Result<Envelope, AcpError> {
    let value: Value = serde_json::from_str(frame.trim())
        .map_err(|e| classify(RawFailure::Decode(format!("Malformed frame: {}", e))))?;

    let obj = value
        .as_object()
        .ok_or_else(|| classify(RawFailure::Decode("Frame is not a JSON object".to_string())))?;

    let method = match obj.get("method") {
        Some(Value::String(m)) => Some(m.clone()),
        Some(_) => {
            return Err(classify(RawFailure::Decode(
                "Method is not a string".to_string(),
            )))
        }
        None => None,
    };
    let id = obj.get("id").filter(|id| !id.is_null()).cloned();
    let params = obj.get("params").cloned();

    match (method, id) {
        (Some(method), Some(id)) => Ok(Envelope::Request(JsonRpcRequest::new(id, &method, params))),
        (Some(method), None) => Ok(Envelope::Notification(JsonRpcNotification::new(
            &method, params,
        ))),
        (None, Some(id)) => {
            if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
                let error: JsonRpcError = serde_json::from_value(error.clone()).map_err(|e| {
                    classify(RawFailure::Decode(format!("Malformed error object: {}", e)))
                })?;
                Ok(Envelope::Response(JsonRpcResponse {
                    jsonrpc: crate::types::JSONRPC_VERSION.to_string(),
                    id,
                    result: None,
                    error: Some(error),
                }))
            } else if let Some(result) = obj.get("result") {
                Ok(Envelope::Response(JsonRpcResponse::success(id, result.clone())))
            } else {
                Err(classify(RawFailure::Decode(
                    "Response carries neither result nor error".to_string(),
                )))
            }
        }
        (None, None) => Err(classify(RawFailure::Decode(format!(
            "Unknown message shape: {}",
            snippet(frame)
        )))),
    }
}

/// Decode one inbound frame into a typed message.
///
/// Notifications with an unrecognised method, and session updates that do
/// not match a known update kind, are rejected as `UNKNOWN`.
pub fn decode(frame: &str) -> Result<AcpMessage, AcpError> {
    match decode_envelope(frame)? {
        Envelope::Response(response) => Ok(AcpMessage::Response(response)),
        Envelope::Request(request) => Ok(AcpMessage::AgentRequest(request)),
        Envelope::Notification(notification) => match notification.method.as_str() {
            METHOD_SESSION_UPDATE => {
                let params = notification.params.ok_or_else(|| {
                    AcpError::unknown("Missing params in session/update")
                })?;
                let params = legacy::normalize_session_update(params);
                let update: SessionUpdateNotification = serde_json::from_value(params.clone())
                    .map_err(|e| {
                        AcpError::unknown(format!("Unrecognised session update: {}", e))
                            .with_details(params)
                    })?;
                Ok(AcpMessage::Notification(AgentNotification::SessionUpdate(update)))
            }
            other => Err(AcpError::unknown(format!(
                "Unrecognised notification method: {}",
                other
            ))),
        },
    }
}

fn snippet(frame: &str) -> String {
    frame.chars().take(200).collect()
}

/// Adapter for session update shapes predating the current protocol.
///
/// Runs before strict decoding so the core never sees permissive shapes.
pub mod legacy {
    use serde_json::{Map, Value};

    /// Update tags renamed since early agent releases
    const TAG_ALIASES: &[(&str, &str)] = &[("thought", "agent_thought_chunk")];

    /// Rewrite a `session/update` params object into
    /// `{ "sessionId": ..., "update": { "sessionUpdate": ..., ... } }`.
    pub fn normalize_session_update(params: Value) -> Value {
        let Value::Object(mut obj) = params else {
            return params;
        };

        if !obj.contains_key("update") && obj.contains_key("sessionUpdate") {
            // Flattened form: every key except sessionId belongs to the update
            let session_id = obj.remove("sessionId");
            let update: Map<String, Value> = std::mem::take(&mut obj);
            if let Some(session_id) = session_id {
                obj.insert("sessionId".to_string(), session_id);
            }
            obj.insert("update".to_string(), Value::Object(update));
        }

        if let Some(Value::Object(update)) = obj.get_mut("update") {
            if let Some(Value::String(tag)) = update.get_mut("sessionUpdate") {
                if let Some((_, current)) = TAG_ALIASES.iter().find(|(old, _)| *old == tag.as_str()) {
                    *tag = current.to_string();
                }
            }
        }

        Value::Object(obj)
    }
}
