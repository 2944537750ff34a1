//! Session state types

use crate::error::AcpError;
use serde::Serialize;

use super::{
    PermissionOption, ToolCallContent, ToolCallLocation, ToolCallSnapshot, ToolCallStatus,
    ToolCallUpdateFields, ToolKind,
};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

/// Tracked agent-initiated action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    /// Opaque to this layer
    pub raw_input: Option<serde_json::Value>,
    pub raw_output: Option<serde_json::Value>,
    pub content: Vec<ToolCallContent>,
    pub locations: Vec<ToolCallLocation>,
    pub error: Option<AcpError>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ToolCall {
    /// New tool call in `pending`, whatever status the snapshot announced
    pub fn from_snapshot(snapshot: ToolCallSnapshot) -> Self {
        Self {
            id: snapshot.tool_call_id,
            title: snapshot.title,
            kind: snapshot.kind,
            status: ToolCallStatus::Pending,
            raw_input: snapshot.raw_input,
            raw_output: snapshot.raw_output,
            content: snapshot.content,
            locations: snapshot.locations,
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    pub fn from_fields(fields: &ToolCallUpdateFields) -> Self {
        Self {
            id: fields.tool_call_id.clone(),
            title: fields.title.clone().unwrap_or_default(),
            kind: fields.kind.unwrap_or_default(),
            status: ToolCallStatus::Pending,
            raw_input: fields.raw_input.clone(),
            raw_output: fields.raw_output.clone(),
            content: fields.content.clone().unwrap_or_default(),
            locations: fields.locations.clone().unwrap_or_default(),
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        }
    }

    /// Merge non-status fields from an update
    pub fn merge_fields(&mut self, fields: &ToolCallUpdateFields) {
        if let Some(title) = &fields.title {
            self.title = title.clone();
        }
        if let Some(kind) = fields.kind {
            self.kind = kind;
        }
        if let Some(content) = &fields.content {
            self.content = content.clone();
        }
        if let Some(locations) = &fields.locations {
            self.locations = locations.clone();
        }
        if fields.raw_input.is_some() {
            self.raw_input = fields.raw_input.clone();
        }
        if fields.raw_output.is_some() {
            self.raw_output = fields.raw_output.clone();
        }
    }

    /// Key under which standing permission decisions are remembered.
    ///
    /// An untitled call is identified by its raw input instead; with neither
    /// there is nothing to compare, so no decision is remembered for it.
    pub fn action_key(&self) -> Option<ActionKey> {
        let input = if self.title.is_empty() {
            let raw = self.raw_input.as_ref().filter(|v| !v.is_null())?;
            Some(raw.to_string())
        } else {
            None
        };
        Some(ActionKey {
            kind: self.kind,
            title: self.title.clone(),
            input,
        })
    }
}

/// Two actions are equivalent when they share kind and title, or, when
/// untitled, kind and raw input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ActionKey {
    pub kind: ToolKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

/// Approval prompt surfaced to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call: ToolCall,
    pub options: Vec<PermissionOption>,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}
