//! Serialized call/response client over one agent process.
//!
//! A call writes one request line and then reads until one response line
//! arrives. The stream has no framing beyond newlines, so two calls must
//! never interleave: the whole write-then-read cycle runs under one lock and
//! concurrent callers queue on it.
//!
//! # Lock order
//!
//! `calls` (which also owns the stdout reader) is always taken before
//! `stdin`. [`AcpClient::close`] takes `stdin` alone, so it can deliver EOF
//! to the child even while a call is blocked reading.
//!
//! # Cancellation
//!
//! A call cancelled while queued has no side effect. A call cancelled after
//! its request was written leaves an unread response in the pipe; the client
//! is then poisoned and every later call fails, since the next read would
//! pick up the stale response. A failed read of the output stream poisons
//! the client the same way.
//!
//! Bad content never poisons: an oversized line is skipped whole by the
//! codec and a line that is not valid UTF-8 or JSON is consumed by
//! [`parse_response`], so the next call starts on a clean line boundary.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acp::codec::{AcpCodec, AcpFrame};
use crate::acp::diagnostics::drain_diagnostics;
use crate::acp::protocol::{parse_response, AgentMessage, RpcRequest};
use crate::acp::spawner::{spawn_agent_process, AgentProcess, SpawnConfig};
use crate::{AppError, Result};

type ResponseReader = FramedRead<ChildStdout, AcpCodec>;

/// Call/response client owning one agent child process.
pub struct AcpClient {
    label: String,
    pid: Option<u32>,
    next_id: AtomicU64,
    closed: AtomicBool,
    poisoned: OnceLock<&'static str>,
    max_line_bytes: usize,
    calls: Mutex<Option<ResponseReader>>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    diagnostics: JoinHandle<()>,
    cancel: CancellationToken,
    process_exit_timeout: Duration,
}

impl AcpClient {
    /// Spawn the agent process for `workspace` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the process cannot be started.
    pub fn spawn(config: &SpawnConfig, workspace: &Path) -> Result<Self> {
        let process = spawn_agent_process(config, workspace)?;
        Ok(Self::from_process(process, config))
    }

    /// Wrap an already-spawned process. Starts the stderr drain task.
    #[must_use]
    pub fn from_process(process: AgentProcess, config: &SpawnConfig) -> Self {
        let AgentProcess {
            workspace,
            child,
            stdin,
            stdout,
            stderr,
        } = process;

        let pid = child.id();
        let label = format!("{}#{}", workspace.display(), pid.unwrap_or(0));
        let cancel = CancellationToken::new();
        let diagnostics =
            drain_diagnostics(label.clone(), stderr, config.max_line_bytes, cancel.clone());

        let reader = FramedRead::with_capacity(
            stdout,
            AcpCodec::with_max_line_bytes(config.max_line_bytes),
            config.read_buffer_bytes,
        );

        Self {
            label,
            pid,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            poisoned: OnceLock::new(),
            max_line_bytes: config.max_line_bytes,
            calls: Mutex::new(Some(reader)),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            diagnostics,
            cancel,
            process_exit_timeout: config.process_exit_timeout,
        }
    }

    /// Human-readable identity used in logs (`workspace#pid`).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, if the child was still running when wrapped.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send user content and wait for the agent's reply.
    ///
    /// # Errors
    ///
    /// - [`AppError::ClientClosed`] after [`close`](Self::close).
    /// - [`AppError::Acp`] if the client is poisoned, the reply id does not
    ///   match, or the reply line exceeds the size cap. An oversized reply
    ///   is consumed in full and the client stays usable.
    /// - [`AppError::ProcessExited`] if the request cannot be written or the
    ///   output stream ends before a reply.
    /// - [`AppError::MalformedResponse`] / [`AppError::Remote`] per
    ///   [`parse_response`].
    /// - [`AppError::Cancelled`] if `cancel` fires first.
    pub async fn send_message(
        &self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentMessage> {
        self.ensure_usable()?;

        let mut calls = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(AppError::Cancelled("send_message cancelled while queued".into()));
            }
            guard = self.calls.lock() => guard,
        };

        // close() may have run while this call was queued.
        self.ensure_usable()?;
        let Some(reader) = calls.as_mut() else {
            return Err(AppError::ClientClosed);
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("acp_call", agent = %self.label, id);
        self.call(reader, id, content, cancel).instrument(span).await
    }

    /// One write-then-read cycle. The caller holds the `calls` lock.
    async fn call(
        &self,
        reader: &mut ResponseReader,
        id: u64,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentMessage> {
        let request = RpcRequest::send_message(id, content);
        let mut bytes = serde_json::to_vec(&request)
            .map_err(|e| AppError::Acp(format!("failed to serialise request: {e}")))?;
        bytes.push(b'\n');
        self.write_request(&bytes).await?;
        debug!("request written");

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.poison("a cancelled call left an unread response");
                    warn!("call cancelled after request was written; client poisoned");
                    return Err(AppError::Cancelled(format!(
                        "send_message cancelled awaiting response to request {id}"
                    )));
                }
                item = reader.next() => item,
            };

            match item {
                None => {
                    return Err(AppError::ProcessExited(format!(
                        "no response to request {id}: agent output stream closed"
                    )));
                }
                Some(Err(e)) => {
                    // Whatever the agent wrote next is no longer trustworthy.
                    self.poison("reading the response failed");
                    warn!(error = %e, "agent output unreadable; client poisoned");
                    return Err(e);
                }
                Some(Ok(AcpFrame::Oversized(len))) => {
                    warn!(len, "agent reply exceeded line limit");
                    return Err(AppError::Acp(format!(
                        "line too long: exceeded {} bytes",
                        self.max_line_bytes
                    )));
                }
                Some(Ok(AcpFrame::Line(line))) if line.iter().all(u8::is_ascii_whitespace) => {}
                Some(Ok(AcpFrame::Line(line))) => {
                    let result = parse_response(&line, id);
                    if let Err(ref e) = result {
                        warn!(error = %e, "agent call failed");
                    }
                    return result;
                }
            }
        }
    }

    /// Shut the agent down.
    ///
    /// Closes stdin so the child sees EOF, waits up to the configured exit
    /// timeout, kills the child if it is still running, then releases the
    /// remaining streams. Calling it again is a no-op. A non-zero exit
    /// status is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if waiting for or killing the child fails.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let span = info_span!("acp_close", agent = %self.label);
        self.shutdown_process().instrument(span).await
    }

    async fn shutdown_process(&self) -> Result<()> {
        // Contended only by an in-flight write.
        match tokio::time::timeout(self.process_exit_timeout, self.stdin.lock()).await {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => warn!("stdin still busy after grace period; skipping EOF"),
        }

        let child = self.child.lock().await.take();
        let mut outcome = Ok(());

        if let Some(mut child) = child {
            match tokio::time::timeout(self.process_exit_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(code = ?status.code(), "agent process exited");
                }
                Ok(Err(err)) => {
                    warn!(%err, "error waiting for agent process");
                    outcome = Err(AppError::Io(format!("failed waiting for agent exit: {err}")));
                }
                Err(_) => {
                    warn!(
                        timeout = ?self.process_exit_timeout,
                        "agent did not exit within grace period, forcing kill"
                    );
                    if let Err(err) = child.kill().await {
                        warn!(%err, "failed to force-kill agent process");
                        outcome = Err(AppError::Io(format!("failed to kill agent: {err}")));
                    }
                }
            }
        }

        self.cancel.cancel();
        // A call still holding the reader drops it when it returns.
        if let Ok(mut reader) = self.calls.try_lock() {
            reader.take();
        }

        outcome
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::ClientClosed);
        }
        if let Some(reason) = self.poisoned.get() {
            return Err(AppError::Acp(format!("client poisoned: {reason}")));
        }
        Ok(())
    }

    fn poison(&self, reason: &'static str) {
        // The first cause wins; later ones are consequences of it.
        let _ = self.poisoned.set(reason);
    }

    async fn write_request(&self, bytes: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(AppError::ClientClosed);
        };

        pipe.write_all(bytes)
            .await
            .map_err(|e| AppError::ProcessExited(format!("failed to write request: {e}")))?;
        pipe.flush()
            .await
            .map_err(|e| AppError::ProcessExited(format!("failed to flush request: {e}")))
    }
}

impl Drop for AcpClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.diagnostics.abort();
    }
}

impl std::fmt::Debug for AcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpClient")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .field("poisoned", &self.poisoned.get())
            .finish_non_exhaustive()
    }
}
