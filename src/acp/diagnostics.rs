//! Agent stderr drain.
//!
//! Agents write free-form diagnostics to stderr. If nobody reads the pipe it
//! eventually fills and the child blocks, so every client runs one of these
//! tasks for its whole lifetime.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::{AcpCodec, AcpFrame};

/// Spawn a task that forwards each stderr line to `tracing`.
///
/// Lines are logged at `DEBUG` under the `agent_stderr` target, decoded
/// lossily since agents owe us no particular encoding on stderr. Oversized
/// lines are reported and skipped. Content never stops the drain; only EOF,
/// a failed read of the pipe, or `cancel` does.
#[must_use]
pub fn drain_diagnostics<R>(
    label: String,
    stderr: R,
    max_line_bytes: usize,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(stderr, AcpCodec::with_max_line_bytes(max_line_bytes));

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!(agent = %label, "stderr drain: cancellation received, stopping");
                    break;
                }

                item = framed.next() => match item {
                    None => {
                        debug!(agent = %label, "stderr drain: EOF");
                        break;
                    }
                    Some(Ok(AcpFrame::Line(line))) => {
                        let line = String::from_utf8_lossy(&line);
                        debug!(target: "agent_stderr", agent = %label, "{line}");
                    }
                    Some(Ok(AcpFrame::Oversized(len))) => {
                        warn!(agent = %label, len, "stderr drain: skipping oversized line");
                    }
                    Some(Err(e)) => {
                        warn!(agent = %label, error = %e, "stderr drain: read failed, stopping");
                        break;
                    }
                },
            }
        }
    })
}
