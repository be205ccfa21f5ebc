//! SSE frame scanning and in-band error events.
//!
//! The proxy never rewrites downstream bytes; it only needs to know where
//! `data:`-bearing events end so each forwarded message can be charged
//! against the shared rate window, and so a stream can be cut cleanly at an
//! event boundary. [`FrameScanner`] does that incrementally across arbitrary
//! chunk splits.

use bytes::Bytes;

/// Maximum field-name prefix the scanner keeps per line; `data:` is five
/// bytes.
const PREFIX_LEN: usize = 5;

/// Incremental scanner over an SSE byte stream.
///
/// Feeds on raw chunks and reports the byte offset just past each completed
/// event that carried at least one `data:` line. Events without data
/// (comments, bare `event:`/`id:` fields) terminate silently, matching the
/// dispatch rule of the SSE format.
#[derive(Debug, Default)]
pub struct FrameScanner {
    /// First bytes of the current line, for field-name detection.
    prefix: Vec<u8>,
    /// Content length of the current line, excluding a trailing CR.
    line_len: usize,
    /// Whether the last byte seen was a CR (candidate CRLF).
    pending_cr: bool,
    /// Whether the current event has a data line so far.
    has_data: bool,
}

impl FrameScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans one chunk; returns the offsets just past each data-bearing
    /// event completed within it.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<usize> {
        let mut boundaries = Vec::new();

        for (i, &byte) in chunk.iter().enumerate() {
            if byte == b'\n' {
                let content_len = self.line_len - usize::from(self.pending_cr);
                if content_len == 0 {
                    // Blank line: event boundary.
                    if self.has_data {
                        boundaries.push(i + 1);
                    }
                    self.has_data = false;
                } else if self.prefix.starts_with(b"data:") || self.prefix == b"data" {
                    // `data` with no colon is a valid empty data line.
                    self.has_data = true;
                }
                self.prefix.clear();
                self.line_len = 0;
                self.pending_cr = false;
            } else {
                if self.pending_cr {
                    // Lone CR inside a line: treat as content.
                    self.pending_cr = false;
                }
                if byte == b'\r' {
                    self.pending_cr = true;
                }
                self.line_len += 1;
                if self.prefix.len() < PREFIX_LEN && byte != b'\r' {
                    self.prefix.push(byte);
                }
            }
        }

        boundaries
    }
}

/// Builds the in-band termination frame, bit-exact:
///
/// ```text
/// event: pylon_error
/// data: {"code":"<code>","message":"<human text>"}
///
/// ```
#[must_use]
pub fn error_frame(code: &str, message: &str) -> Bytes {
    let data = serde_json::json!({ "code": code, "message": message });
    Bytes::from(format!("event: pylon_error\ndata: {data}\n\n"))
}
