// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Content-Length framing for stream transports.
//!
//! TCP and TLS deliver a byte stream; complete SIP messages are carved out by
//! locating the blank line terminating the headers and adding the declared
//! Content-Length. NAT keep-alives arrive as stray CRLF/whitespace bytes
//! between messages and are counted and discarded.

use bytes::{Buf, Bytes, BytesMut};

use crate::{parse_content_length_value, ParseError};

/// Result of a successful extraction: the message occupies
/// `buf[skipped .. skipped + len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extraction {
    /// Leading whitespace bytes (keep-alives) preceding the message.
    pub skipped: usize,
    /// Total message length: headers, blank line, and body.
    pub len: usize,
}

/// Locates one complete SIP message at the front of `buf`.
///
/// Leading space/tab/CR/LF bytes are skipped and reported. Returns
/// [`ParseError::Incomplete`] when more bytes are needed — the caller must
/// not consume anything in that case — and [`ParseError::Malformed`] when
/// the Content-Length is unusable, which closes the connection.
pub fn extract_message(buf: &[u8]) -> Result<Extraction, ParseError> {
    let skipped = leading_whitespace(buf);
    let rest = &buf[skipped..];
    if rest.is_empty() {
        return Err(ParseError::Incomplete);
    }

    let head_end = memchr::memmem::find(rest, b"\r\n\r\n").ok_or(ParseError::Incomplete)?;
    let content_length = scan_content_length(&rest[..head_end]).map_err(|offset| {
        ParseError::Malformed {
            offset: skipped + offset,
        }
    })?;

    let len = head_end + 4 + content_length.unwrap_or(0);
    if rest.len() < len {
        return Err(ParseError::Incomplete);
    }
    Ok(Extraction { skipped, len })
}

/// Counts leading whitespace bytes (space, tab, CR, LF).
pub fn leading_whitespace(buf: &[u8]) -> usize {
    buf.iter()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .count()
}

/// Scans raw header bytes for Content-Length (full or compact `l` form).
///
/// The name match is case-insensitive with whitespace tolerated around the
/// colon; the value is the first contiguous ASCII digit run. `Err(offset)`
/// reports a header that exists but has no parsable value, or disagreeing
/// repeated values.
fn scan_content_length(headers: &[u8]) -> Result<Option<usize>, usize> {
    let mut found: Option<usize> = None;
    let mut line_start = 0;
    for line in headers.split(|b| *b == b'\n') {
        let offset = line_start;
        line_start += line.len() + 1;

        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        if !eq_ignore_case(name, b"content-length") && !eq_ignore_case(name, b"l") {
            continue;
        }
        let value = std::str::from_utf8(trim_ascii(&line[colon + 1..])).map_err(|_| offset)?;
        let parsed = parse_content_length_value(value).ok_or(offset)?;
        if let Some(existing) = found {
            if existing != parsed {
                return Err(offset);
            }
        } else {
            found = Some(parsed);
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    let end = input
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &input[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Accumulating frame reader for one stream connection.
///
/// Bytes read from the socket are appended; complete frames are drained off
/// the front while residual bytes slide down for the next read. The buffer
/// is bounded at twice the maximum message size.
#[derive(Debug)]
pub struct MessageReader {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageReader {
    /// Creates a reader sized for messages up to `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_message_size * 2),
            max_message_size,
        }
    }

    /// Appends bytes received from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drains the next complete message, or `Ok(None)` when more bytes are
    /// needed. `Err` means the connection must be closed.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, ParseError> {
        match extract_message(&self.buf) {
            Ok(Extraction { skipped, len }) => {
                if len > self.max_message_size {
                    return Err(ParseError::Malformed { offset: skipped });
                }
                self.buf.advance(skipped);
                Ok(Some(self.buf.split_to(len).freeze()))
            }
            Err(ParseError::Incomplete) => {
                // Keep-alive whitespace never completes a message; drop it so
                // it cannot accumulate.
                let skipped = leading_whitespace(&self.buf);
                if skipped > 0 {
                    self.buf.advance(skipped);
                }
                if self.buf.len() > self.max_message_size * 2 {
                    return Err(ParseError::Malformed { offset: 0 });
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains every complete message currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Bytes>, ParseError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_message()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
