//! Per-session update fan-out
//!
//! Each session owns one dispatcher. Subscribers get a bounded channel; a
//! slow subscriber applies backpressure to the session instead of growing an
//! unbounded queue. After `close` nothing more is delivered.

use crate::error::AcpError;
use crate::types::{PermissionRequest, SessionUpdate, ToolCall};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Event delivered to session subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// Update streamed by the agent
    Update(SessionUpdate),
    /// Tool call state changed by a local decision (approval, rejection, cancel)
    ToolCall(ToolCall),
    /// The agent is waiting for an approval decision
    PermissionRequested(PermissionRequest),
    /// The session ended because of this error
    Terminated(AcpError),
}

pub struct UpdateDispatcher {
    session_id: String,
    buffer: usize,
    subscribers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    closed: AtomicBool,
}

impl UpdateDispatcher {
    pub fn new(session_id: impl Into<String>, buffer: usize) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receiver for all events dispatched from now on
    pub fn subscribe(&self) -> Result<mpsc::Receiver<SessionEvent>, AcpError> {
        if self.is_closed() {
            return Err(AcpError::connection_not_ready(format!(
                "Session {} is closed",
                self.session_id
            )));
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    /// Run `handler` for every event on a background task
    pub fn subscribe_with<F>(&self, mut handler: F) -> Result<JoinHandle<()>, AcpError>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let mut rx = self.subscribe()?;
        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        }))
    }

    /// Deliver to every live subscriber, in call order. Returns how many
    /// subscribers received it.
    pub async fn dispatch(&self, payload: EventPayload) -> usize {
        if self.is_closed() {
            trace!("Dropping event for closed session {}", self.session_id);
            return 0;
        }

        let event = SessionEvent {
            session_id: self.session_id.clone(),
            payload,
        };
        let subscribers: Vec<_> = self.subscribers.lock().clone();

        let mut delivered = 0;
        for tx in &subscribers {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if delivered < subscribers.len() {
            debug!("Pruning dropped subscribers of {}", self.session_id);
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
        delivered
    }

    /// Stop delivery. Receivers see the end of their stream once drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.subscribers.lock().clear();
        }
    }
}
