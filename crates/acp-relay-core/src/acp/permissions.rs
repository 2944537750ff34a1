//! Permission broker
//!
//! Holds the approval prompts an agent is waiting on and the standing
//! decisions ("always allow" / "always reject") taken for equivalent actions.
//!
//! # Flow
//!
//! 1. The agent's `session/request_permission` calls [`PermissionBroker::request`]
//! 2. A standing decision for the same action answers immediately
//! 3. Otherwise a [`PermissionRequest`] is dispatched to subscribers and the
//!    call waits on a oneshot channel
//! 4. The caller answers with [`PermissionBroker::resolve`]; cancellation,
//!    timeout or session close answer with [`PermissionDecision::Cancelled`]

use super::dispatcher::{EventPayload, UpdateDispatcher};
use crate::error::{AcpError, AgentError};
use crate::types::{ActionKey, PermissionOption, PermissionOptionKind, PermissionRequest, ToolCall};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How a permission request ended
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// An offered option was chosen, by the caller or by a standing decision
    Selected(PermissionOption),
    /// No option was chosen
    Cancelled(AcpError),
}

struct PendingPermission {
    request: PermissionRequest,
    tx: oneshot::Sender<PermissionDecision>,
}

pub struct PermissionBroker {
    session_id: String,
    dispatcher: Arc<UpdateDispatcher>,
    timeout: Option<Duration>,
    pending: Mutex<HashMap<String, PendingPermission>>,
    standing: Mutex<HashMap<ActionKey, PermissionOptionKind>>,
    closed: AtomicBool,
}

impl PermissionBroker {
    pub fn new(
        session_id: impl Into<String>,
        dispatcher: Arc<UpdateDispatcher>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            dispatcher,
            timeout,
            pending: Mutex::new(HashMap::new()),
            standing: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Ask for a decision on `tool_call`, waiting until one exists
    pub async fn request(
        &self,
        tool_call: ToolCall,
        options: Vec<PermissionOption>,
    ) -> PermissionDecision {
        let standing = tool_call
            .action_key()
            .and_then(|key| self.standing_option(&key, &options));
        if let Some(option) = standing {
            info!(
                "Session {}: standing {:?} applied to {}",
                self.session_id, option.kind, tool_call.id
            );
            return PermissionDecision::Selected(option);
        }

        let request = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            tool_call,
            options,
            requested_at: chrono::Utc::now(),
        };
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if self.closed.load(Ordering::SeqCst) {
                return PermissionDecision::Cancelled(AcpError::connection_not_ready(
                    "Session closed",
                ));
            }
            if pending
                .values()
                .any(|p| p.request.tool_call.id == request.tool_call.id)
            {
                warn!(
                    "Session {}: tool call {} already awaits a decision",
                    self.session_id, request.tool_call.id
                );
                return PermissionDecision::Cancelled(AcpError::unknown(
                    "Duplicate permission request for tool call",
                ));
            }
            pending.insert(
                request.id.clone(),
                PendingPermission {
                    request: request.clone(),
                    tx,
                },
            );
        }

        debug!(
            "Session {}: permission requested {} for {}",
            self.session_id, request.id, request.tool_call.id
        );
        let request_id = request.id.clone();
        self.dispatcher
            .dispatch(EventPayload::PermissionRequested(request))
            .await;

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(&request_id);
                    warn!(
                        "Session {}: permission request {} timed out",
                        self.session_id, request_id
                    );
                    return PermissionDecision::Cancelled(AcpError::timeout(format!(
                        "No permission decision within {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| {
            PermissionDecision::Cancelled(AcpError::connection_not_ready(
                "Permission request dropped",
            ))
        })
    }

    /// Answer a pending request with one of its offered options
    pub fn resolve(&self, request_id: &str, option_id: &str) -> Result<PermissionOption, AgentError> {
        let mut pending = self.pending.lock();
        let entry = pending
            .remove(request_id)
            .ok_or_else(|| AgentError::PermissionNotFound(request_id.to_string()))?;

        let offered = entry
            .request
            .options
            .iter()
            .find(|o| o.option_id == option_id)
            .cloned();
        let Some(option) = offered else {
            pending.insert(request_id.to_string(), entry);
            return Err(AgentError::UnknownOption(option_id.to_string()));
        };
        drop(pending);

        if option.kind.is_standing() {
            match entry.request.tool_call.action_key() {
                Some(key) => {
                    info!(
                        "Session {}: remembering {:?} for {:?}",
                        self.session_id, option.kind, key
                    );
                    self.standing.lock().insert(key, option.kind);
                }
                None => warn!(
                    "Session {}: {:?} for unidentified tool call {} applies once",
                    self.session_id, option.kind, entry.request.tool_call.id
                ),
            }
        }

        let _ = entry.tx.send(PermissionDecision::Selected(option.clone()));
        Ok(option)
    }

    /// Cancel the request pending for a tool call, if any
    pub fn cancel_tool_call(&self, tool_call_id: &str, error: AcpError) -> bool {
        let mut pending = self.pending.lock();
        let Some(request_id) = pending
            .iter()
            .find(|(_, p)| p.request.tool_call.id == tool_call_id)
            .map(|(id, _)| id.clone())
        else {
            return false;
        };

        if let Some(entry) = pending.remove(&request_id) {
            let _ = entry.tx.send(PermissionDecision::Cancelled(error));
        }
        true
    }

    /// Cancel every pending request
    pub fn cancel_all(&self, error: AcpError) {
        let drained: Vec<PendingPermission> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for entry in drained {
            let _ = entry.tx.send(PermissionDecision::Cancelled(error.clone()));
        }
    }

    /// Cancel everything and refuse new requests
    pub fn close(&self, error: AcpError) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all(error);
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        self.pending.lock().values().map(|p| p.request.clone()).collect()
    }

    pub fn standing_decision(&self, key: &ActionKey) -> Option<PermissionOptionKind> {
        self.standing.lock().get(key).copied()
    }

    /// Offered option matching the standing decision for `key`
    fn standing_option(&self, key: &ActionKey, options: &[PermissionOption]) -> Option<PermissionOption> {
        let kind = self.standing_decision(key)?;
        let preference = if kind.is_allow() {
            [PermissionOptionKind::AllowAlways, PermissionOptionKind::AllowOnce]
        } else {
            [PermissionOptionKind::RejectAlways, PermissionOptionKind::RejectOnce]
        };
        preference
            .iter()
            .find_map(|wanted| options.iter().find(|o| o.kind == *wanted))
            .cloned()
    }
}
