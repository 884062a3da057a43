//! NDJSON framing for ACP agent streams.
//!
//! Splits the byte stream on `\n` with a hard maximum line length so a
//! misbehaving agent cannot make the client buffer an unbounded response.
//! Pair it with [`tokio_util::codec::FramedRead::with_capacity`] to pre-size
//! the read buffer.
//!
//! The decoder never fails on content. `FramedRead` ends the stream for one
//! poll after any decoder error, which would look like EOF to the reader, so
//! oversized lines are reported as [`AcpFrame::Oversized`] and bytes are
//! handed over unvalidated. UTF-8 and JSON checks belong to the caller.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Default maximum line length accepted by the ACP codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Default initial read buffer size: 64 KiB.
pub const READ_BUFFER_BYTES: usize = 65_536;

/// One decoded unit of an agent stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcpFrame {
    /// A complete line without its `\n` (or `\r\n`) terminator.
    Line(Bytes),
    /// A line longer than the limit was skipped in full; carries its length.
    Oversized(usize),
}

/// Bounded newline framing for inbound ACP streams.
///
/// A line over the limit is discarded up to and including its newline and
/// reported once as [`AcpFrame::Oversized`]; the following line is decoded
/// normally. Only read failures from the underlying stream surface as
/// [`AppError::Io`].
#[derive(Debug)]
pub struct AcpCodec {
    max_line_bytes: usize,
    next_index: usize,
    discarding: bool,
    discarded: usize,
}

impl AcpCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with an explicit line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
            discarded: 0,
        }
    }

    /// Configured line limit in bytes.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn take_discarded(&mut self) -> AcpFrame {
        self.discarding = false;
        self.next_index = 0;
        AcpFrame::Oversized(std::mem::take(&mut self.discarded))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn without_terminator(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

impl Decoder for AcpCodec {
    type Item = AcpFrame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AcpFrame>> {
        loop {
            if self.discarding {
                match src.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        self.discarded += offset;
                        src.advance(offset + 1);
                        return Ok(Some(self.take_discarded()));
                    }
                    None => {
                        self.discarded += src.len();
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            // A line of exactly `max_line_bytes` still has room for its newline.
            let read_to = src.len().min(self.max_line_bytes.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    return Ok(Some(AcpFrame::Line(without_terminator(line))));
                }
                None if src.len() > self.max_line_bytes => {
                    self.discarding = true;
                    self.discarded = 0;
                    self.next_index = 0;
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<AcpFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if self.discarding {
            return Ok(Some(self.take_discarded()));
        }

        if src.is_empty() {
            return Ok(None);
        }

        self.next_index = 0;
        Ok(Some(AcpFrame::Line(without_terminator(src.split()))))
    }
}
