//! Client-side callback interface for agent-initiated traffic

use crate::error::{AcpError, Result};
use crate::types::{
    FsReadTextFileParams, FsWriteTextFileParams, RequestPermissionOutcome,
    RequestPermissionParams, SessionUpdateNotification,
};
use async_trait::async_trait;

/// Handles requests and notifications an agent sends to the client.
///
/// The connection calls `on_session_update` sequentially in wire order.
/// Agent requests are served concurrently, each on its own task.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Serve `fs/read_text_file`
    async fn read_text_file(&self, params: FsReadTextFileParams) -> Result<String>;

    /// Serve `fs/write_text_file`
    async fn write_text_file(&self, params: FsWriteTextFileParams) -> Result<()>;

    /// Serve `session/request_permission`. Resolves once a decision exists.
    async fn request_permission(&self, params: RequestPermissionParams) -> RequestPermissionOutcome;

    async fn on_session_update(&self, notification: SessionUpdateNotification);

    /// The agent's output closed while the connection was still open
    async fn on_disconnect(&self, error: AcpError);
}
