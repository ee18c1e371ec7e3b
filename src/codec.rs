//! Line framing for chat messages.
//!
//! A single readiness drain can deliver a partial line, one line, or several
//! lines glued together. The decoder buffers raw bytes and yields exactly one
//! message per `\n`-terminated line, so message boundaries survive partial
//! sends and coalesced reads.

use bytes::BytesMut;

/// Incremental newline-delimited decoder.
///
/// Bytes accumulate until a `\n` arrives; a trailing `\r` is stripped and the
/// line is decoded as UTF-8 (lossily, invalid sequences become replacement
/// characters). If the accumulator reaches capacity with no newline in sight,
/// the whole buffer is flushed as one message to keep memory bounded.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    capacity: usize,
}

impl LineDecoder {
    /// Create a decoder that buffers at most `capacity` bytes per line.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed a raw chunk, returning every message completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            lines.push(decode(&line[..pos]));
        }

        // Oversized line with no terminator: flush what we have.
        if self.buf.len() >= self.capacity {
            let line = self.buf.split();
            lines.push(decode(&line));
        }

        lines
    }

    /// Bytes buffered while waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = match raw.last() {
        Some(b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}
