//! Newline-delimited frame transport over an agent's stdio

use super::protocol::{encode, Envelope};
use super::retry::{classify, RawFailure};
use crate::error::AcpError;
use crate::types::LaunchCommand;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

const READ_CHUNK: usize = 8 * 1024;
const CHANNEL_CAPACITY: usize = 100;

/// Splits a byte stream into complete frames.
///
/// Partial input is held until its newline arrives. A frame that grows past
/// `max_frame_bytes` is discarded up to the next newline.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Feed bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            if self.buf.len() + head.len() > self.max_frame_bytes {
                warn!("Dropping oversized frame ({} bytes)", self.buf.len() + head.len());
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            if let Some(frame) = Self::clean(line) {
                frames.push(frame);
            }
        }

        if !self.discarding {
            if self.buf.len() + rest.len() > self.max_frame_bytes {
                warn!("Frame exceeds {} bytes, discarding", self.max_frame_bytes);
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Trim the line and strip log noise some agents print before the JSON
    fn clean(line: Vec<u8>) -> Option<String> {
        let line = match String::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping non-UTF-8 frame: {}", e);
                return None;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.find('{') {
            Some(0) => Some(trimmed.to_string()),
            Some(start) => {
                debug!("Stripping non-JSON prefix: {}", &trimmed[..start]);
                Some(trimmed[start..].to_string())
            }
            None => {
                debug!("Agent stdout (non-JSON): {}", trimmed);
                None
            }
        }
    }
}

/// Transport layer for ACP communication.
/// Uses channels to avoid lock contention between send and receive.
pub struct Transport {
    /// Channel to the writer task
    outbound_tx: mpsc::Sender<String>,
    /// Channel from the reader task
    inbound_rx: Mutex<mpsc::Receiver<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Spawn a new agent process and create transport
    pub fn spawn(
        command: &LaunchCommand,
        program: Option<&Path>,
        extra_env: &HashMap<String, String>,
        cwd: Option<&Path>,
        max_frame_bytes: usize,
    ) -> Result<(Self, Child), AcpError> {
        let program = program
            .map(|p| p.as_os_str().to_owned())
            .unwrap_or_else(|| command.program.clone().into());
        debug!("Spawning agent: {:?} {:?} (cwd: {:?})", program, command.args, cwd);

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .envs(&command.env)
            .envs(extra_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| classify(RawFailure::Spawn(e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AcpError::connection_not_ready("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AcpError::connection_not_ready("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AcpError::connection_not_ready("Failed to capture stderr"))?;

        let mut transport = Self::from_io(stdout, stdin, max_frame_bytes);
        // Drain stderr so the agent can't deadlock on a full pipe
        transport.tasks.push(tokio::spawn(Self::read_stderr_task(stderr)));

        Ok((transport, child))
    }

    /// Transport over an arbitrary byte stream pair
    pub fn from_io<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        let writer_task = tokio::spawn(Self::write_task(writer, outbound_rx));
        let reader_task = tokio::spawn(Self::read_task(reader, inbound_tx, max_frame_bytes));

        Self {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            tasks: vec![writer_task, reader_task],
        }
    }

    async fn write_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
        while let Some(frame) = rx.recv().await {
            trace!("Sending: {}", frame.trim_end());
            if let Err(e) = writer.write_all(frame.as_bytes()).await {
                error!("Failed to write frame: {}", e);
                break;
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush: {}", e);
                break;
            }
        }
        debug!("Writer task ended");
    }

    async fn read_task<R: AsyncRead + Unpin>(
        mut reader: R,
        tx: mpsc::Sender<String>,
        max_frame_bytes: usize,
    ) {
        let mut framer = FrameBuffer::new(max_frame_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("Agent stdout closed");
                    break;
                }
                Ok(n) => {
                    for frame in framer.push(&chunk[..n]) {
                        trace!("Received: {}", frame);
                        if tx.send(frame).await.is_err() {
                            debug!("Inbound channel closed");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading agent stdout: {}", classify(RawFailure::Io(e)));
                    break;
                }
            }
        }
    }

    async fn read_stderr_task(stderr: ChildStderr) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Agent stderr closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        // Agents log here; not fatal
                        warn!("Agent stderr: {}", trimmed);
                    }
                }
                Err(e) => {
                    error!("Error reading agent stderr: {}", e);
                    break;
                }
            }
        }
    }

    /// Encode and queue one envelope
    pub async fn send(&self, envelope: &Envelope) -> Result<(), AcpError> {
        let frame = encode(envelope)?;
        self.outbound_tx.send(frame).await.map_err(|_| {
            classify(RawFailure::Disconnected("Agent input channel closed".to_string()))
        })
    }

    /// Next complete frame, or `None` once the agent's output is closed
    pub async fn recv_frame(&self) -> Option<String> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
