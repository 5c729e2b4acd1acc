//! Stream framing for JSON-RPC over stdio.
//!
//! Inbound streams may mix two framings, discriminated per message:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! <123 bytes of JSON>
//! ```
//!
//! or one JSON value per line. Outbound framing is always line-delimited.

use serde_json::Value;
use tracing::{debug, warn};

const HEADER_MARKER: &[u8] = b"content-length:";
const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Incremental decoder over an inbound byte stream.
///
/// Bytes arrive in arbitrary chunks via [`FrameDecoder::push`]; whole decoded
/// messages are drained via [`FrameDecoder::next_message`]. A frame that
/// fails to parse is logged and dropped without poisoning the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Option<Value> {
        loop {
            if self.buf.is_empty() {
                return None;
            }

            let marker = find_ci(&self.buf, HEADER_MARKER);
            let newline = self.buf.iter().position(|&b| b == b'\n');

            // A Content-Length header governs the next message only when it
            // is not preceded by a complete line; otherwise that line is a
            // newline-delimited message in its own right.
            let header_first = match (marker, newline) {
                (Some(m), Some(n)) => m < n,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if header_first {
                match self.decode_length_prefixed(marker.unwrap_or(0)) {
                    Step::Message(v) => return Some(v),
                    Step::Continue => continue,
                    Step::Incomplete => return None,
                }
            } else {
                match self.decode_line() {
                    Step::Message(v) => return Some(v),
                    Step::Continue => continue,
                    Step::Incomplete => return None,
                }
            }
        }
    }

    fn decode_length_prefixed(&mut self, marker: usize) -> Step {
        // Bytes before the header are tolerated and discarded.
        if marker > 0 {
            debug!(discarded = marker, "discarding bytes before Content-Length header");
            self.buf.drain(..marker);
        }

        let Some(sep) = find(&self.buf, HEADER_SEPARATOR) else {
            return Step::Incomplete;
        };
        let body_start = sep + HEADER_SEPARATOR.len();

        let digits_start = HEADER_MARKER.len();
        let digits_end = find(&self.buf[..sep + 2], b"\r\n").unwrap_or(sep);
        let len = std::str::from_utf8(&self.buf[digits_start..digits_end])
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok());

        let Some(len) = len else {
            warn!("malformed Content-Length header, skipping header region");
            self.buf.drain(..body_start);
            return Step::Continue;
        };

        if self.buf.len() < body_start + len {
            return Step::Incomplete;
        }

        let body: Vec<u8> = self.buf.drain(..body_start + len).skip(body_start).collect();
        match serde_json::from_slice(&body) {
            Ok(v) => Step::Message(v),
            Err(e) => {
                warn!(error = %e, "dropping unparseable length-prefixed frame");
                Step::Continue
            }
        }
    }

    fn decode_line(&mut self) -> Step {
        let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
            return Step::Incomplete;
        };

        let line: Vec<u8> = self.buf.drain(..=nl).take(nl).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\r').trim();
        if text.is_empty() {
            return Step::Continue;
        }

        match serde_json::from_str(text) {
            Ok(v) => Step::Message(v),
            Err(e) => {
                warn!(error = %e, line = %text, "dropping unparseable line frame");
                Step::Continue
            }
        }
    }
}

enum Step {
    Message(Value),
    Continue,
    Incomplete,
}

/// Encode one message for the wire: compact JSON plus a single `\n`.
pub fn encode_line(value: &Value) -> String {
    let mut out = value.to_string();
    out.push('\n');
    out
}

/// Encode one message with LSP-style Content-Length framing. The proxy never
/// emits this itself but peers may, so the decoder has to round-trip it.
pub fn encode_content_length(value: &Value) -> Vec<u8> {
    let body = value.to_string();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(dec: &mut FrameDecoder) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = dec.next_message() {
            out.push(v);
        }
        out
    }

    #[test]
    fn decodes_line_delimited() {
        let mut dec = FrameDecoder::new();
        dec.push(b"{\"a\":1}\n{\"b\":2}\r\n");
        assert_eq!(drain(&mut dec), vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn decodes_length_prefixed() {
        let mut dec = FrameDecoder::new();
        dec.push(&encode_content_length(&json!({"a": 1})));
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn header_is_case_insensitive() {
        let mut dec = FrameDecoder::new();
        dec.push(b"content-length: 7\r\n\r\n{\"a\":1}");
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn mixed_framings_round_trip_in_order() {
        let values = vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3}), json!({"v": 4})];
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_content_length(&values[0]));
        stream.extend_from_slice(encode_line(&values[1]).as_bytes());
        stream.extend_from_slice(&encode_content_length(&values[2]));
        stream.extend_from_slice(encode_line(&values[3]).as_bytes());

        let mut dec = FrameDecoder::new();
        dec.push(&stream);
        assert_eq!(drain(&mut dec), values);
    }

    #[test]
    fn line_before_header_is_not_discarded() {
        let mut dec = FrameDecoder::new();
        dec.push(b"{\"v\":1}\nContent-Length: 7\r\n\r\n{\"v\":2}");
        assert_eq!(drain(&mut dec), vec![json!({"v": 1}), json!({"v": 2})]);
    }

    #[test]
    fn reassembles_across_arbitrary_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_content_length(&json!({"big": "x".repeat(100)})));
        stream.extend_from_slice(encode_line(&json!({"n": 2})).as_bytes());

        for chunk_size in [1, 3, 7, 50] {
            let mut dec = FrameDecoder::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                dec.push(chunk);
                got.extend(drain(&mut dec));
            }
            assert_eq!(got.len(), 2, "chunk size {}", chunk_size);
            assert_eq!(got[1], json!({"n": 2}));
        }
    }

    #[test]
    fn junk_before_header_is_discarded() {
        let mut dec = FrameDecoder::new();
        dec.push(b"stray bytes Content-Length: 7\r\n\r\n{\"a\":1}");
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn malformed_header_is_skipped() {
        let mut dec = FrameDecoder::new();
        dec.push(b"Content-Length: zzz\r\n\r\n{\"a\":1}\n");
        // The header region is skipped; the body then parses as a line frame.
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn empty_lines_are_ignored() {
        let mut dec = FrameDecoder::new();
        dec.push(b"\n\r\n{\"a\":1}\n\n");
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn bad_frame_does_not_poison_the_stream() {
        let mut dec = FrameDecoder::new();
        dec.push(b"not json at all\n{\"ok\":true}\n");
        assert_eq!(drain(&mut dec), vec![json!({"ok": true})]);
    }

    #[test]
    fn incomplete_body_waits_for_more_bytes() {
        let mut dec = FrameDecoder::new();
        dec.push(b"Content-Length: 7\r\n\r\n{\"a\"");
        assert!(dec.next_message().is_none());
        dec.push(b":1}");
        assert_eq!(drain(&mut dec), vec![json!({"a": 1})]);
    }

    #[test]
    fn encode_line_is_single_terminated_line() {
        let s = encode_line(&json!({"a": 1}));
        assert!(s.ends_with('\n'));
        assert_eq!(s.matches('\n').count(), 1);
    }
}
