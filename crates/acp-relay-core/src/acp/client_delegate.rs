//! Agent Client Delegate implementation
//!
//! Session-scoped [`AgentClient`]: serves file requests from the session
//! workspace, feeds tool call updates through the state machine, runs
//! permission requests through the broker, and dispatches the results.

use super::dispatcher::{EventPayload, UpdateDispatcher};
use super::permissions::{PermissionBroker, PermissionDecision};
use super::tool_calls::ToolCallTracker;
use super::traits::AgentClient;
use crate::error::{AcpError, Error, Result, SandboxError};
use crate::sandbox::Workspace;
use crate::types::{
    FsReadTextFileParams, FsWriteTextFileParams, PermissionOptionKind, RequestPermissionOutcome,
    RequestPermissionParams, SessionUpdate, SessionUpdateNotification, ToolCall,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct AgentClientDelegate {
    session_id: String,
    workspace: Option<Workspace>,
    tracker: Arc<ToolCallTracker>,
    broker: Arc<PermissionBroker>,
    dispatcher: Arc<UpdateDispatcher>,
    /// Signals the owning session that the agent went away
    fatal_tx: mpsc::Sender<AcpError>,
}

impl AgentClientDelegate {
    pub fn new(
        session_id: impl Into<String>,
        workspace: Option<Workspace>,
        tracker: Arc<ToolCallTracker>,
        broker: Arc<PermissionBroker>,
        dispatcher: Arc<UpdateDispatcher>,
        fatal_tx: mpsc::Sender<AcpError>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace,
            tracker,
            broker,
            dispatcher,
            fatal_tx,
        }
    }

    fn workspace(&self) -> Result<&Workspace> {
        self.workspace
            .as_ref()
            .ok_or(Error::Sandbox(SandboxError::NoWorkspace))
    }

    async fn publish_tool_call(&self, call: Option<ToolCall>) {
        if let Some(call) = call {
            self.dispatcher.dispatch(EventPayload::ToolCall(call)).await;
        }
    }

    /// Apply an approval decision to the tool call
    async fn apply_decision(&self, tool_call_id: &str, kind: PermissionOptionKind) {
        let changed = if kind.is_allow() {
            self.tracker.approve(tool_call_id)
        } else {
            self.tracker.fail(
                tool_call_id,
                AcpError::permission_denied(format!("Tool call {} rejected", tool_call_id)),
            )
        };
        self.publish_tool_call(changed).await;
    }
}

#[async_trait]
impl AgentClient for AgentClientDelegate {
    async fn read_text_file(&self, params: FsReadTextFileParams) -> Result<String> {
        debug!("Reading file for session {}: {}", self.session_id, params.path);
        self.workspace()?
            .read_text_file(&params.path, params.line, params.limit)
            .await
    }

    async fn write_text_file(&self, params: FsWriteTextFileParams) -> Result<()> {
        debug!("Writing file for session {}: {}", self.session_id, params.path);
        self.workspace()?
            .write_text_file(&params.path, &params.content)
            .await
    }

    async fn request_permission(&self, params: RequestPermissionParams) -> RequestPermissionOutcome {
        let tool_call = self.tracker.ensure(&params.tool_call);
        if tool_call.status.is_terminal() {
            debug!(
                "Session {}: permission asked for finished tool call {}",
                self.session_id, tool_call.id
            );
            return RequestPermissionOutcome::Cancelled;
        }

        let tool_call_id = tool_call.id.clone();
        match self.broker.request(tool_call, params.options).await {
            PermissionDecision::Selected(option) => {
                self.apply_decision(&tool_call_id, option.kind).await;
                RequestPermissionOutcome::Selected {
                    option_id: option.option_id,
                }
            }
            PermissionDecision::Cancelled(error) => {
                let changed = self.tracker.fail(&tool_call_id, error);
                self.publish_tool_call(changed).await;
                RequestPermissionOutcome::Cancelled
            }
        }
    }

    async fn on_session_update(&self, notification: SessionUpdateNotification) {
        let update = notification.update;
        let accepted = match &update {
            SessionUpdate::ToolCall(snapshot) => self.tracker.announce(snapshot.clone()).is_some(),
            SessionUpdate::ToolCallUpdate(fields) => self.tracker.apply_update(fields).is_some(),
            _ => true,
        };
        if accepted {
            self.dispatcher.dispatch(EventPayload::Update(update)).await;
        }
    }

    async fn on_disconnect(&self, error: AcpError) {
        if self.fatal_tx.try_send(error).is_err() {
            warn!("Session {} already shutting down", self.session_id);
        }
    }
}
