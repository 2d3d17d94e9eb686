//! Incremental parser for the backend's event stream.
//!
//! Frames are separated by a blank line (`\n\n`). Inside a frame only two
//! line kinds matter, `event: <name>` and `data: <payload>`; when a line kind
//! repeats, the last one wins. Everything else is ignored.
//!
//! Field matching follows the event-stream grammar rather than literal
//! prefixes: the space after the colon is optional (`data:x` is the payload
//! `x`), and a frame named `message` is the default event, so it carries a
//! chunk like an unnamed one.
//!
//! Network reads can split a frame, or a multi-byte character, anywhere. The
//! parser keeps both the undecoded byte tail and the incomplete frame text
//! between calls, so the emitted frame sequence does not depend on how the
//! byte stream was chunked.

use std::fmt;

/// Frame delimiter.
const DELIMITER: &str = "\n\n";
/// Unicode replacement character emitted for invalid byte sequences.
const REPLACEMENT: char = '\u{FFFD}';

/// One event-stream frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Event name; `None` means the default message event.
    pub event: Option<String>,
    /// Payload of the last `data:` line, if any.
    pub data: Option<String>,
}

impl Frame {
    /// Classify the frame by its event name.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.event.as_deref() {
            None | Some("message") => FrameKind::Chunk,
            Some("sources") => FrameKind::Sources,
            Some("ready") => FrameKind::Ready,
            Some("done") => FrameKind::Done,
            Some("error") => FrameKind::Error,
            Some(_) => FrameKind::Unknown,
        }
    }

    /// Parse the text of one complete frame (delimiter excluded).
    ///
    /// Returns `None` when the frame holds neither an event nor a data line.
    fn parse(text: &str) -> Option<Self> {
        let mut frame = Self::default();
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(name) = field_value(line, "event") {
                frame.event = Some(name.trim().to_string());
            } else if let Some(payload) = field_value(line, "data") {
                frame.data = Some(payload.to_string());
            }
        }
        (frame.event.is_some() || frame.data.is_some()).then_some(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(event) = &self.event {
            writeln!(f, "event: {event}")?;
        }
        if let Some(data) = &self.data {
            writeln!(f, "data: {data}")?;
        }
        f.write_str("\n")
    }
}

/// `field:value` with at most one space after the colon stripped.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// What a frame means to the session controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Default event: a piece of answer text.
    Chunk,
    /// JSON array of citations.
    Sources,
    /// Backend acknowledged the request but has not produced tokens yet.
    Ready,
    /// Advisory end marker.
    Done,
    /// Backend-side failure report.
    Error,
    /// Anything else.
    Unknown,
}

/// Streaming UTF-8 decoder.
///
/// Holds back an incomplete trailing sequence until the next push; invalid
/// sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode as much of `pending + bytes` as is complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_len]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(REPLACEMENT);
                            consumed += valid_len + bad;
                        }
                        None => {
                            // Truncated sequence at the end: wait for more bytes.
                            consumed += valid_len;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is left; an incomplete sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Incremental frame parser.
#[derive(Debug, Default)]
pub struct FrameParser {
    decoder: Utf8StreamDecoder,
    buffer: String,
    /// Prefix of `buffer` already searched for a delimiter.
    scanned: usize,
}

impl FrameParser {
    /// Create an empty parser.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            decoder: Utf8StreamDecoder::new(),
            buffer: String::new(),
            scanned: 0,
        }
    }

    /// Feed raw bytes from the transport and return every completed frame.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let text = self.decoder.push(bytes);
        self.push_str(&text)
    }

    /// Feed already decoded text and return every completed frame.
    pub fn push_str(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();
        let mut start = 0;
        // A delimiter may straddle the previous push.
        let mut from = self.scanned.saturating_sub(DELIMITER.len() - 1);
        while let Some(end) = find_delimiter(self.buffer.as_bytes(), from) {
            if let Some(frame) = Frame::parse(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + DELIMITER.len();
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Consume the parser at end of stream.
    ///
    /// The trailing text never saw its delimiter, so it is not a frame; it is
    /// returned (with any undecoded bytes) only so the caller can log it.
    #[must_use]
    pub fn finish(mut self) -> String {
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        self.buffer
    }
}

/// Byte offset of the first delimiter at or after `from`.
fn find_delimiter(haystack: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER.as_bytes())
        .map(|offset| from + offset)
}
