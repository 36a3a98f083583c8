//! Frame extraction for the gateway's event stream.
//!
//! The stream body is `text/event-stream`: each event is one or more `data:`
//! lines terminated by a blank line. Some gateways skip the SSE envelope and
//! write one JSON object per line, so bare lines are accepted as whole frames.

use bytes::{Bytes, BytesMut};
use log::trace;

/// Upper bound for a single buffered line or frame.
pub const FRAME_MAX_SIZE: usize = 2 << 23;

/// A frame decoder that buffers incoming data and extracts complete frames.
pub struct FrameDecoder {
    buffer: BytesMut,
    pending: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            pending: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > FRAME_MAX_SIZE && !self.buffer.contains(&b'\n') {
            trace!(
                "Line length {} exceeds maximum size {}, dropping buffered data",
                self.buffer.len(),
                FRAME_MAX_SIZE
            );
            self.buffer.clear();
        }
    }

    pub fn decode_frame(&mut self) -> Option<Bytes> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n')?;
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if self.pending.is_empty() {
                    continue;
                }
                let frame = self.pending.split().freeze();
                trace!("<-- Decoded frame: {} bytes", frame.len());
                return Some(frame);
            }

            // Comment lines carry keepalives.
            if line.first() == Some(&b':') {
                continue;
            }

            if let Some(value) = field_value(&line, b"data") {
                if !self.pending.is_empty() {
                    self.pending.extend_from_slice(b"\n");
                }
                if self.pending.len() + value.len() > FRAME_MAX_SIZE {
                    trace!("Frame exceeds maximum size {}, dropping", FRAME_MAX_SIZE);
                    self.pending.clear();
                    continue;
                }
                self.pending.extend_from_slice(value);
                continue;
            }

            if [&b"event"[..], b"id", b"retry"]
                .iter()
                .any(|name| field_value(&line, name).is_some())
            {
                continue;
            }

            // Bare line outside an SSE envelope.
            if self.pending.is_empty() {
                let frame = line.freeze();
                trace!("<-- Decoded bare frame: {} bytes", frame.len());
                return Some(frame);
            }
            self.pending.extend_from_slice(b"\n");
            self.pending.extend_from_slice(&line);
        }
    }

    /// Returns the number of bytes currently buffered waiting for more data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// Clears the internal buffers.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the value of an SSE `name: value` line, with one leading space removed.
fn field_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(name)?;
    let value = rest.strip_prefix(b":")?;
    Some(value.strip_prefix(b" ").unwrap_or(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_frame_split_across_feeds() {
        let mut decoder = FrameDecoder::new();

        decoder.feed(b"data: {\"type\":");
        assert!(decoder.decode_frame().is_none());

        decoder.feed(b"\"messages\"}\n");
        assert!(decoder.decode_frame().is_none());

        decoder.feed(b"\n");
        let frame = decoder.decode_frame().expect("frame should be complete");
        assert_eq!(&frame[..], br#"{"type":"messages"}"#);
        assert!(decoder.decode_frame().is_none());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"event: message\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");

        let frame = decoder.decode_frame().expect("frame should be complete");
        assert_eq!(&frame[..], b"{\"a\":\n1}");
    }

    #[test]
    fn test_comments_and_blank_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b": keepalive\n\n\n: ping\ndata:{}\n\n");

        let frame = decoder.decode_frame().expect("frame should be complete");
        assert_eq!(&frame[..], b"{}");
        assert!(decoder.decode_frame().is_none());
    }

    #[test]
    fn test_bare_json_lines_are_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"n\":1}\n{\"n\":2}\n{\"n\":");

        assert_eq!(&decoder.decode_frame().unwrap()[..], b"{\"n\":1}");
        assert_eq!(&decoder.decode_frame().unwrap()[..], b"{\"n\":2}");
        assert!(decoder.decode_frame().is_none());

        decoder.feed(b"3}\n");
        assert_eq!(&decoder.decode_frame().unwrap()[..], b"{\"n\":3}");
    }

    #[test]
    fn test_clear_drops_partial_state() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: partial\n");
        decoder.decode_frame();
        assert!(decoder.buffered_len() > 0);

        decoder.clear();
        decoder.feed(b"\n");
        assert!(decoder.decode_frame().is_none());
    }
}
