//! Failure classification, retry and credential rotation
//!
//! Raw failures from the transport, the process layer and JSON-RPC error
//! objects all funnel through [`classify`]. [`RetryPolicy`] then decides
//! whether to re-issue, and [`CredentialPool`] is the single place where the
//! active credential changes.

use crate::config::RetryConfig;
use crate::error::{AcpError, AcpErrorKind};
use crate::types::{error_codes, JsonRpcError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{info, warn};

/// Unclassified failure as observed at a boundary
#[derive(Debug)]
pub enum RawFailure {
    /// Read or write on the agent's pipes failed
    Io(std::io::Error),
    /// The agent process could not be started
    Spawn(std::io::Error),
    /// The agent answered with a JSON-RPC error object
    Rpc(JsonRpcError),
    /// No response within the deadline
    Timeout(String),
    /// The agent side of the connection went away
    Disconnected(String),
    /// A frame could not be decoded
    Decode(String),
}

/// Map a raw failure onto the taxonomy. Every failure path goes through here.
pub fn classify(raw: RawFailure) -> AcpError {
    match raw {
        RawFailure::Io(e) => match e.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock => AcpError::network(e.to_string(), true),
            ErrorKind::TimedOut => AcpError::timeout(e.to_string()),
            ErrorKind::UnexpectedEof => AcpError::connection_not_ready(e.to_string()),
            _ => AcpError::network(e.to_string(), false),
        },
        RawFailure::Spawn(e) => match e.kind() {
            ErrorKind::NotFound => {
                AcpError::unknown(format!("Agent executable not found: {}", e))
            }
            ErrorKind::PermissionDenied => {
                AcpError::unknown(format!("Agent executable not runnable: {}", e))
            }
            _ => AcpError::connection_not_ready(format!("Failed to start agent: {}", e)),
        },
        RawFailure::Rpc(error) => classify_rpc(error),
        RawFailure::Timeout(message) => AcpError::timeout(message),
        RawFailure::Disconnected(message) => AcpError::connection_not_ready(message),
        RawFailure::Decode(message) => AcpError::unknown(message),
    }
}

fn classify_rpc(error: JsonRpcError) -> AcpError {
    let details = serde_json::json!({ "code": error.code, "data": error.data });

    // Agents that speak our taxonomy say so explicitly
    let declared = error
        .data
        .as_ref()
        .and_then(|d| d.get("kind"))
        .and_then(|k| k.as_str())
        .and_then(AcpErrorKind::parse);
    if let Some(kind) = declared {
        // Only a network failure can be transient or permanent; every other
        // kind has a fixed retry class
        let declared_retryable = error
            .data
            .as_ref()
            .and_then(|d| d.get("retryable"))
            .and_then(|r| r.as_bool());
        let retryable = match (kind, declared_retryable) {
            (AcpErrorKind::NetworkError, Some(retryable)) => retryable,
            _ => kind.default_retryable(),
        };
        return AcpError::new(kind, error.message)
            .with_retryable(retryable)
            .with_details(details);
    }

    let lower = error.message.to_lowercase();
    let classified = if error.code == error_codes::AUTH_REQUIRED || is_auth_error(&lower) {
        AcpError::authentication_failed(error.message)
    } else if is_session_gone(&lower) {
        AcpError::session_expired(error.message)
    } else if lower.contains("permission denied") || lower.contains("not permitted") {
        AcpError::permission_denied(error.message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        AcpError::timeout(error.message)
    } else if is_transient(&lower) {
        AcpError::network(error.message, true)
    } else {
        AcpError::unknown(error.message)
    };
    classified.with_details(details)
}

fn is_auth_error(lower: &str) -> bool {
    lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("unauthenticated")
        || lower.contains("invalid api key")
        || has_status(lower, &["401", "403"])
}

fn is_session_gone(lower: &str) -> bool {
    lower.contains("session not found")
        || lower.contains("unknown session")
        || lower.contains("session expired")
        || lower.contains("expired session")
}

/// Rate limits and upstream server errors
fn is_transient(lower: &str) -> bool {
    has_status(lower, &["429", "502", "503", "504"])
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("connection")
}

/// An HTTP status code standing alone, e.g. `HTTP 401`, `status: 503` or
/// `(429)`; digits inside longer numbers or identifiers do not count
fn has_status(lower: &str, codes: &[&str]) -> bool {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| codes.contains(&word))
}

/// Bounded exponential backoff. No jitter, so waits are deterministic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// A retryable error is only returned once attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T, AcpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AcpError>>,
    {
        self.run_until(label, op, || false).await
    }

    /// Like [`run`](Self::run), but stops early once `stopped` reports true
    pub async fn run_until<T, F, Fut, S>(
        &self,
        label: &str,
        mut op: F,
        stopped: S,
    ) -> Result<T, AcpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AcpError>>,
        S: Fn() -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable && attempt < self.max_attempts && !stopped() => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.retryable && !stopped() {
                        warn!("{} gave up after {} attempt(s): {}", label, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Retry, then rotate to the next credential and start over.
    ///
    /// Rotation happens after retries are exhausted or on an authentication
    /// failure. When no candidate is left the last error is returned.
    pub async fn run_with_rotation<T, F, Fut, R, RFut, S>(
        &self,
        label: &str,
        pool: &parking_lot::Mutex<CredentialPool>,
        mut op: F,
        mut on_rotate: R,
        stopped: S,
    ) -> Result<T, AcpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AcpError>>,
        R: FnMut(CredentialDescriptor) -> RFut,
        RFut: Future<Output = Result<(), AcpError>>,
        S: Fn() -> bool,
    {
        loop {
            let error = match self.run_until(label, &mut op, &stopped).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let rotatable = error.retryable || error.kind == AcpErrorKind::AuthenticationFailed;
            if !rotatable || stopped() {
                return Err(error);
            }

            let next = pool.lock().rotate().cloned();
            match next {
                Some(credential) => {
                    info!("{}: rotating to credential {}", label, credential.label);
                    on_rotate(credential).await?;
                }
                None => {
                    warn!("{}: all credentials exhausted", label);
                    return Err(error);
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

/// One candidate credential: a model to switch to and/or launch environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDescriptor {
    pub label: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Applied when the agent process is launched
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CredentialDescriptor {
    pub fn model(label: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            model: Some(model.into()),
            env: HashMap::new(),
        }
    }
}

/// Ordered fallback chain of credentials; the first entry is active initially
#[derive(Debug, Clone)]
pub struct CredentialPool {
    candidates: Vec<CredentialDescriptor>,
    active: usize,
}

impl CredentialPool {
    pub fn new(candidates: Vec<CredentialDescriptor>) -> Self {
        Self {
            candidates,
            active: 0,
        }
    }

    pub fn current(&self) -> Option<&CredentialDescriptor> {
        self.candidates.get(self.active)
    }

    /// Advance to the next candidate. `None` once the chain is exhausted.
    pub fn rotate(&mut self) -> Option<&CredentialDescriptor> {
        if self.active >= self.candidates.len() {
            return None;
        }
        self.active += 1;
        self.candidates.get(self.active)
    }

    pub fn remaining(&self) -> usize {
        self.candidates.len().saturating_sub(self.active + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn rpc(code: i32, message: &str) -> RawFailure {
        RawFailure::Rpc(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        })
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = classify(RawFailure::Timeout("no response".to_string()));
        assert_eq!(err.kind, AcpErrorKind::Timeout);
        assert!(err.retryable);
    }

    #[test]
    fn test_classify_io() {
        let reset = classify(RawFailure::Io(std::io::Error::from(ErrorKind::ConnectionReset)));
        assert_eq!(reset.kind, AcpErrorKind::NetworkError);
        assert!(reset.retryable);

        let refused = classify(RawFailure::Io(std::io::Error::from(ErrorKind::ConnectionRefused)));
        assert_eq!(refused.kind, AcpErrorKind::NetworkError);
        assert!(!refused.retryable);

        let eof = classify(RawFailure::Io(std::io::Error::from(ErrorKind::UnexpectedEof)));
        assert_eq!(eof.kind, AcpErrorKind::ConnectionNotReady);
    }

    #[test]
    fn test_classify_spawn_not_found_is_terminal() {
        let err = classify(RawFailure::Spawn(std::io::Error::from(ErrorKind::NotFound)));
        assert_eq!(err.kind, AcpErrorKind::Unknown);
        assert!(!err.retryable);
    }

    #[test]
    fn test_classify_rpc_messages() {
        assert_eq!(
            classify(rpc(-32000, "Authentication required")).kind,
            AcpErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify(rpc(-32603, "HTTP 401 Unauthorized")).kind,
            AcpErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify(rpc(-32602, "Session not found: abc")).kind,
            AcpErrorKind::SessionExpired
        );

        let limited = classify(rpc(-32603, "Rate limit exceeded (429)"));
        assert_eq!(limited.kind, AcpErrorKind::NetworkError);
        assert!(limited.retryable);

        assert_eq!(
            classify(rpc(-32603, "Permission denied by policy")).kind,
            AcpErrorKind::PermissionDenied
        );
        assert_eq!(classify(rpc(-32603, "kaboom")).kind, AcpErrorKind::Unknown);
    }

    #[test]
    fn test_classify_rpc_declared_kind_wins() {
        let err = classify(RawFailure::Rpc(JsonRpcError {
            code: -32603,
            message: "quota exhausted".to_string(),
            data: Some(serde_json::json!({ "kind": "NETWORK_ERROR", "retryable": true })),
        }));
        assert_eq!(err.kind, AcpErrorKind::NetworkError);
        assert!(err.retryable);
        assert_eq!(err.details.unwrap()["code"], -32603);
    }

    #[test]
    fn test_declared_retryable_only_trusted_for_network_errors() {
        let declared = |kind: &str| {
            classify(RawFailure::Rpc(JsonRpcError {
                code: -32603,
                message: "try again".to_string(),
                data: Some(serde_json::json!({ "kind": kind, "retryable": true })),
            }))
        };
        for kind in ["PERMISSION_DENIED", "UNKNOWN", "AUTHENTICATION_FAILED", "SESSION_EXPIRED"] {
            let err = declared(kind);
            assert!(!err.retryable, "{} must not be retryable", kind);
        }

        let permanent = classify(RawFailure::Rpc(JsonRpcError {
            code: -32603,
            message: "bad gateway config".to_string(),
            data: Some(serde_json::json!({ "kind": "NETWORK_ERROR", "retryable": false })),
        }));
        assert!(!permanent.retryable);
    }

    #[test]
    fn test_status_codes_must_stand_alone() {
        assert_eq!(
            classify(rpc(-32603, "Request failed with status: 403")).kind,
            AcpErrorKind::AuthenticationFailed
        );
        assert_eq!(
            classify(rpc(-32603, "Tool t-4012 crashed at line 1403")).kind,
            AcpErrorKind::Unknown
        );
        assert_eq!(
            classify(rpc(-32603, "Record 15030 is invalid")).kind,
            AcpErrorKind::Unknown
        );
        assert!(classify(rpc(-32603, "upstream returned 503")).retryable);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(200), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_exhausts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let counter = calls.clone();
        let result: Result<(), AcpError> = policy
            .run("test", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AcpError::timeout("slow")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), AcpError> = policy
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcpError::permission_denied("no")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, AcpErrorKind::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AcpError::network("reset", true))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stopped_short_circuits_retry() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        let result: Result<(), AcpError> = policy
            .run_until(
                "test",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(AcpError::connection_not_ready("closed")) }
                },
                || true,
            )
            .await;

        assert_eq!(result.unwrap_err().kind, AcpErrorKind::ConnectionNotReady);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_rotation_order() {
        let mut pool = CredentialPool::new(vec![
            CredentialDescriptor::model("primary", "model-a"),
            CredentialDescriptor::model("backup", "model-b"),
        ]);
        assert_eq!(pool.current().unwrap().label, "primary");
        assert_eq!(pool.remaining(), 1);
        assert_eq!(pool.rotate().unwrap().label, "backup");
        assert_eq!(pool.remaining(), 0);
        assert!(pool.rotate().is_none());
        assert!(pool.rotate().is_none());
        assert!(pool.current().is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_rotates_to_next_credential() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let pool = parking_lot::Mutex::new(CredentialPool::new(vec![
            CredentialDescriptor::model("primary", "model-a"),
            CredentialDescriptor::model("backup", "model-b"),
        ]));
        let active = parking_lot::Mutex::new("model-a".to_string());
        let calls = AtomicU32::new(0);

        let result = policy
            .run_with_rotation(
                "test",
                &pool,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let ok = *active.lock() == "model-b";
                    async move {
                        if ok {
                            Ok("done")
                        } else {
                            Err(AcpError::authentication_failed("bad key"))
                        }
                    }
                },
                |credential| {
                    if let Some(model) = credential.model {
                        *active.lock() = model;
                    }
                    async { Ok::<(), AcpError>(()) }
                },
                || false,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        // Auth failures are not retried on the same credential
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_surfaces_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1));
        let pool = parking_lot::Mutex::new(CredentialPool::new(vec![
            CredentialDescriptor::model("only", "model-a"),
        ]));
        let calls = AtomicU32::new(0);

        let result: Result<(), AcpError> = policy
            .run_with_rotation(
                "test",
                &pool,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(AcpError::network("503 overloaded", true)) }
                },
                |_| async { Ok::<(), AcpError>(()) },
                || false,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, AcpErrorKind::NetworkError);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
