//! ACP (Agent Client Protocol) client
//!
//! JSON-RPC 2.0 over newline-delimited stdio, spoken with one agent per
//! session.
//!
//! # Layers
//!
//! - `transport` - framing over the agent's stdin/stdout (or an in-process pipe)
//! - `protocol` - envelope codec, typed decoding, legacy update adapter
//! - `connection` - request/response correlation, agent-initiated requests
//! - `dispatcher` - per-session ordered fan-out of updates
//! - `tool_calls` / `permissions` - tool call lifecycle and approval gating
//! - `retry` - failure classification, backoff, credential rotation
//! - `session` - `Session` and `SessionManager` tying it all together

mod client_delegate;
mod connection;
mod dispatcher;
mod permissions;
mod protocol;
mod retry;
mod session;
mod tool_calls;
pub mod traits;
mod transport;

pub use traits::AgentClient;

pub use client_delegate::AgentClientDelegate;
pub use connection::{AcpConnection, AgentProcess};
pub use dispatcher::{EventPayload, SessionEvent, UpdateDispatcher};
pub use permissions::{PermissionBroker, PermissionDecision};
pub use protocol::{
    decode, decode_envelope, encode, legacy, AcpMessage, AgentNotification, Envelope,
    ProtocolHandler, METHOD_FS_READ_TEXT_FILE, METHOD_FS_WRITE_TEXT_FILE, METHOD_INITIALIZE,
    METHOD_REQUEST_PERMISSION, METHOD_SESSION_CANCEL, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
    METHOD_SESSION_SET_MODEL, METHOD_SESSION_UPDATE,
};
pub use retry::{classify, CredentialDescriptor, CredentialPool, RawFailure, RetryPolicy};
pub use session::{OpenOptions, Session, SessionManager, SessionSummary};
pub use tool_calls::ToolCallTracker;
pub use transport::{FrameBuffer, Transport};
