//! Tool call state machine
//!
//! Status only moves forward: `pending -> in_progress -> {completed|failed}`.
//! Once terminal, a tool call never changes again.

use crate::error::AcpError;
use crate::types::{ToolCall, ToolCallSnapshot, ToolCallStatus, ToolCallUpdateFields};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Tool calls of one session, keyed by id
pub struct ToolCallTracker {
    session_id: String,
    calls: Mutex<HashMap<String, ToolCall>>,
}

impl ToolCallTracker {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<ToolCall> {
        self.calls.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<ToolCall> {
        let mut calls: Vec<ToolCall> = self.calls.lock().values().cloned().collect();
        calls.sort_by_key(|c| c.started_at);
        calls
    }

    /// Track a newly announced tool call.
    ///
    /// It starts `pending`; an announced later status is applied as a
    /// transition. Returns `None` for a duplicate id.
    pub fn announce(&self, snapshot: ToolCallSnapshot) -> Option<ToolCall> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&snapshot.tool_call_id) {
            warn!(
                "Session {}: ignoring duplicate tool call {}",
                self.session_id, snapshot.tool_call_id
            );
            return None;
        }

        let announced = snapshot.status;
        let mut call = ToolCall::from_snapshot(snapshot);
        Self::transition(&mut call, announced);
        calls.insert(call.id.clone(), call.clone());
        Some(call)
    }

    /// Apply a `tool_call_update`. Updates for unknown or terminal tool calls,
    /// and status regressions, are ignored; `None` means nothing changed.
    pub fn apply_update(&self, fields: &ToolCallUpdateFields) -> Option<ToolCall> {
        let mut calls = self.calls.lock();
        let Some(call) = calls.get_mut(&fields.tool_call_id) else {
            debug!(
                "Session {}: ignoring update for unknown tool call {}",
                self.session_id, fields.tool_call_id
            );
            return None;
        };
        if call.status.is_terminal() {
            debug!(
                "Session {}: ignoring update for finished tool call {}",
                self.session_id, call.id
            );
            return None;
        }

        call.merge_fields(fields);
        if let Some(status) = fields.status {
            if status.rank() < call.status.rank() {
                debug!(
                    "Session {}: ignoring status regression {:?} -> {:?} for {}",
                    self.session_id, call.status, status, call.id
                );
            } else {
                Self::transition(call, status);
            }
        }
        Some(call.clone())
    }

    /// Current state of a tool call referenced by a permission request,
    /// tracking it first if the agent never announced it
    pub fn ensure(&self, fields: &ToolCallUpdateFields) -> ToolCall {
        let mut calls = self.calls.lock();
        let call = calls
            .entry(fields.tool_call_id.clone())
            .or_insert_with(|| ToolCall::from_fields(fields));
        if !call.status.is_terminal() {
            call.merge_fields(fields);
        }
        call.clone()
    }

    /// Approval received: `pending -> in_progress`
    pub fn approve(&self, id: &str) -> Option<ToolCall> {
        let mut calls = self.calls.lock();
        let call = calls.get_mut(id)?;
        if call.status != ToolCallStatus::Pending {
            return None;
        }
        Self::transition(call, ToolCallStatus::InProgress);
        Some(call.clone())
    }

    /// Fail a non-terminal tool call with `error`
    pub fn fail(&self, id: &str, error: AcpError) -> Option<ToolCall> {
        let mut calls = self.calls.lock();
        let call = calls.get_mut(id)?;
        if call.status.is_terminal() {
            return None;
        }
        call.error = Some(error);
        Self::transition(call, ToolCallStatus::Failed);
        Some(call.clone())
    }

    fn transition(call: &mut ToolCall, status: ToolCallStatus) {
        if status.rank() <= call.status.rank() {
            return;
        }
        call.status = status;
        if status.is_terminal() {
            call.completed_at = Some(chrono::Utc::now());
        }
    }
}
