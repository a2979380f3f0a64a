//! HTTP/1.1 message framing: a push parser and a serializer.
//!
//! The parser is sans-IO: feed it byte chunks as they arrive and it
//! returns a sequence of [`ParserEvent`]s — message start, body chunks,
//! message end with trailers, or a terminal protocol error. It keeps at
//! most one unparsed message prefix buffered; body bytes are handed out as
//! they are consumed, never accumulated.
//!
//! Framing follows RFC 7230 with two leniencies: bare LF is accepted as a
//! line terminator in header blocks, and one optional space after the
//! field colon is absorbed (the serializer writes exactly one back, so a
//! parse → serialize round trip is byte-stable).

use bytes::{Bytes, BytesMut};

use crate::error::HttpError;
use crate::headers::{Header, Headers};

/// Upper bound on a start-line-plus-headers block (and on a trailer
/// block). Exceeding it is an `oversized-headers` protocol error.
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// A chunk-size line longer than this cannot be a plausible hex size.
const MAX_CHUNK_SIZE_LINE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    fn parse(token: &[u8]) -> Option<Version> {
        match token {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

/// Parsed first line of a message.
#[derive(Debug, Clone)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: Version,
    },
    Response {
        version: Version,
        status: u16,
        phrase: String,
    },
}

/// One step in the parsed event sequence. After an `Error`, no further
/// events are produced for the connection.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    Start { line: StartLine, headers: Headers },
    Body(Bytes),
    End { trailers: Headers },
    Error(HttpError),
}

/// How an outgoing message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    /// No body at all.
    None,
    /// Exactly Content-Length bytes.
    Counted,
    /// Chunked transfer coding.
    Chunked,
    /// Body runs until the connection closes.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    CountedBody { remaining: usize },
    EofBody,
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkCrlf,
    Trailers,
    Error,
}

/// Streaming HTTP/1.1 message parser.
pub struct MessageParser {
    mode: Mode,
    head_response: bool,
    state: State,
    buf: BytesMut,
}

impl MessageParser {
    /// Parser for requests arriving at a server.
    pub fn request() -> MessageParser {
        MessageParser {
            mode: Mode::Request,
            head_response: false,
            state: State::Header,
            buf: BytesMut::new(),
        }
    }

    /// Parser for responses arriving at a client.
    pub fn response() -> MessageParser {
        MessageParser {
            mode: Mode::Response,
            head_response: false,
            state: State::Header,
            buf: BytesMut::new(),
        }
    }

    /// Tell a response parser that the message answers a HEAD request, so
    /// the response has no body regardless of its framing headers.
    pub fn set_head_request(&mut self, head: bool) {
        self.head_response = head;
    }

    /// Between messages with nothing buffered: the state a connection must
    /// be in before it may return to a pool.
    pub fn is_clean(&self) -> bool {
        self.state == State::Header && self.buf.is_empty()
    }

    /// In a close-delimited body, where connection close is the normal end
    /// of the message rather than an error.
    pub fn is_eof_delimited(&self) -> bool {
        self.state == State::EofBody
    }

    /// Feed bytes from the wire; returns the events they complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        if self.state == State::Error {
            return events;
        }
        self.buf.extend_from_slice(chunk);
        self.advance(&mut events);
        events
    }

    /// Signal end of input. Completes a close-delimited body, or reports
    /// `unexpected-eof` when the connection died mid-message.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        let mut events = Vec::new();
        match self.state {
            State::EofBody => {
                self.state = State::Header;
                events.push(ParserEvent::End {
                    trailers: Vec::new(),
                });
            }
            State::Header => {
                if !self.buf.is_empty() {
                    self.fail(&mut events, HttpError::UnexpectedEof);
                }
            }
            State::Error => {}
            _ => self.fail(&mut events, HttpError::UnexpectedEof),
        }
        events
    }

    fn fail(&mut self, events: &mut Vec<ParserEvent>, err: HttpError) {
        self.state = State::Error;
        self.buf.clear();
        events.push(ParserEvent::Error(err));
    }

    fn advance(&mut self, events: &mut Vec<ParserEvent>) {
        loop {
            match self.state {
                State::Error => return,

                State::Header => match find_block_end(&self.buf) {
                    Some((block_len, consumed)) => {
                        if block_len > MAX_HEADER_BLOCK {
                            return self.fail(events, HttpError::OversizedHeaders);
                        }
                        let block = self.buf.split_to(consumed);
                        match self.parse_head(&block[..block_len]) {
                            Ok((line, headers, next)) => {
                                events.push(ParserEvent::Start { line, headers });
                                self.state = next;
                                if next == State::Header {
                                    // Bodyless message.
                                    events.push(ParserEvent::End {
                                        trailers: Vec::new(),
                                    });
                                }
                            }
                            Err(err) => return self.fail(events, err),
                        }
                    }
                    None => {
                        if self.buf.len() > MAX_HEADER_BLOCK {
                            return self.fail(events, HttpError::OversizedHeaders);
                        }
                        return;
                    }
                },

                State::CountedBody { remaining } => {
                    if self.buf.is_empty() {
                        return;
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.split_to(take).freeze();
                    if !chunk.is_empty() {
                        events.push(ParserEvent::Body(chunk));
                    }
                    if take == remaining {
                        self.state = State::Header;
                        events.push(ParserEvent::End {
                            trailers: Vec::new(),
                        });
                    } else {
                        self.state = State::CountedBody {
                            remaining: remaining - take,
                        };
                        return;
                    }
                }

                State::EofBody => {
                    if !self.buf.is_empty() {
                        let chunk = self.buf.split_to(self.buf.len()).freeze();
                        events.push(ParserEvent::Body(chunk));
                    }
                    return;
                }

                State::ChunkSize => match find_crlf(&self.buf) {
                    Some(pos) => {
                        let line = self.buf.split_to(pos + 2);
                        match parse_chunk_size(&line[..pos]) {
                            Some(0) => self.state = State::Trailers,
                            Some(size) => self.state = State::ChunkData { remaining: size },
                            None => {
                                return self.fail(
                                    events,
                                    HttpError::Chunk(format!(
                                        "bad chunk size {:?}",
                                        String::from_utf8_lossy(&line[..pos])
                                    )),
                                );
                            }
                        }
                    }
                    None => {
                        if self.buf.len() > MAX_CHUNK_SIZE_LINE {
                            return self
                                .fail(events, HttpError::Chunk("chunk size line too long".into()));
                        }
                        return;
                    }
                },

                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return;
                    }
                    let take = remaining.min(self.buf.len());
                    let chunk = self.buf.split_to(take).freeze();
                    events.push(ParserEvent::Body(chunk));
                    if take == remaining {
                        self.state = State::ChunkCrlf;
                    } else {
                        self.state = State::ChunkData {
                            remaining: remaining - take,
                        };
                        return;
                    }
                }

                State::ChunkCrlf => {
                    if self.buf.len() < 2 {
                        return;
                    }
                    let two = self.buf.split_to(2);
                    if &two[..] != b"\r\n" {
                        return self
                            .fail(events, HttpError::Chunk("missing delimiter after chunk".into()));
                    }
                    self.state = State::ChunkSize;
                }

                State::Trailers => {
                    // No trailers: the body ends with a bare CRLF.
                    if self.buf.starts_with(b"\r\n") {
                        let _ = self.buf.split_to(2);
                        self.state = State::Header;
                        events.push(ParserEvent::End {
                            trailers: Vec::new(),
                        });
                        continue;
                    }
                    if self.buf.starts_with(b"\n") {
                        let _ = self.buf.split_to(1);
                        self.state = State::Header;
                        events.push(ParserEvent::End {
                            trailers: Vec::new(),
                        });
                        continue;
                    }
                    if &self.buf[..] == b"\r" {
                        return;
                    }
                    match find_block_end(&self.buf) {
                        Some((block_len, consumed)) => {
                            let block = self.buf.split_to(consumed);
                            let lines = split_lines(&block[..block_len]);
                            match parse_fields(&lines) {
                                Ok((trailers, _, _)) => {
                                    self.state = State::Header;
                                    events.push(ParserEvent::End { trailers });
                                }
                                Err(err) => return self.fail(events, err),
                            }
                        }
                        None => {
                            if self.buf.len() > MAX_HEADER_BLOCK {
                                return self.fail(events, HttpError::OversizedHeaders);
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    fn parse_head(&mut self, block: &[u8]) -> Result<(StartLine, Headers, State), HttpError> {
        let mut lines = split_lines(block);
        // Tolerate blank line(s) before the start line.
        while lines.first().is_some_and(|l| trim_bytes(l).is_empty()) {
            lines.remove(0);
        }
        let top = lines
            .first()
            .copied()
            .ok_or_else(|| HttpError::BadStartLine("empty message head".into()))?;

        let line = match self.mode {
            Mode::Request => parse_request_line(top)?,
            Mode::Response => parse_status_line(top)?,
        };

        let (headers, mut transfer_codes, mut content_length) = parse_fields(&lines[1..])?;

        // A Transfer-Encoding header makes any Content-Length meaningless.
        if !transfer_codes.is_empty() {
            content_length = None;
        }

        if self.mode == Mode::Request {
            for code in &transfer_codes {
                if code != "identity" && code != "chunked" {
                    return Err(HttpError::TransferCoding(code.clone()));
                }
            }
        }
        let chunked = transfer_codes.iter().any(|c| c == "chunked");
        if chunked && transfer_codes.last().map(String::as_str) != Some("chunked") {
            return Err(HttpError::Framing(
                "chunked must be the final transfer coding".into(),
            ));
        }
        transfer_codes.retain(|c| c != "identity");

        let allows_body = match &line {
            StartLine::Response { status, .. } => {
                let bodyless =
                    (100..200).contains(status) || *status == 204 || *status == 304;
                !bodyless && !self.head_response
            }
            StartLine::Request { .. } => {
                content_length.is_some() || !transfer_codes.is_empty()
            }
        };

        let next = if !allows_body {
            State::Header
        } else if chunked {
            State::ChunkSize
        } else if let Some(len) = content_length {
            if len == 0 {
                State::Header
            } else {
                State::CountedBody { remaining: len }
            }
        } else {
            match self.mode {
                // A response with no declared length runs until close.
                Mode::Response => State::EofBody,
                // A request with no declared length has no body.
                Mode::Request => State::Header,
            }
        };
        Ok((line, headers, next))
    }
}

// ── Low-level scanning ──────────────────────────────────────────────────

/// Find the end of a header block. Lines may end in CRLF or bare LF, so
/// the block terminator is any of CRLFCRLF, CRLFLF, LFCRLF, LFLF. Returns
/// `(block_len, bytes_consumed_including_terminator)`.
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        let rest = &buf[i..];
        for pattern in [&b"\r\n\r\n"[..], &b"\r\n\n"[..], &b"\n\r\n"[..], &b"\n\n"[..]] {
            if rest.starts_with(pattern) {
                return Some((i, i + pattern.len()));
            }
        }
    }
    None
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    (0..buf.len().saturating_sub(1)).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

/// Split a header block into lines, accepting CRLF or bare LF endings.
fn split_lines(block: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, b) in block.iter().enumerate() {
        if *b == b'\n' {
            let mut end = i;
            if end > start && block[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(&block[start..end]);
            start = i + 1;
        }
    }
    if start < block.len() {
        let mut end = block.len();
        if end > start && block[end - 1] == b'\r' {
            end -= 1;
        }
        lines.push(&block[start..end]);
    }
    lines
}

fn trim_bytes(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &b[start..end]
}

fn parse_request_line(line: &[u8]) -> Result<StartLine, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::BadStartLine("request line is not ASCII".into()))?;
    let mut parts = text.split_ascii_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::BadStartLine(text.into()));
    };
    let version = Version::parse(version.as_bytes())
        .ok_or_else(|| HttpError::Version(version.to_string()))?;
    Ok(StartLine::Request {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

fn parse_status_line(line: &[u8]) -> Result<StartLine, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::BadStartLine("status line is not ASCII".into()))?;
    let rest = text.trim_start();
    let (version_token, rest) = match rest.split_once(' ') {
        Some(split) => split,
        None => return Err(HttpError::BadStartLine(text.into())),
    };
    let version = Version::parse(version_token.as_bytes())
        .ok_or_else(|| HttpError::Version(version_token.to_string()))?;
    let (status_token, phrase) = match rest.trim_start().split_once(' ') {
        Some((s, p)) => (s, p),
        None => (rest.trim_start(), ""),
    };
    let status: u16 = status_token
        .parse()
        .map_err(|_| HttpError::BadStartLine(text.into()))?;
    if !(100..=599).contains(&status) {
        return Err(HttpError::BadStartLine(text.into()));
    }
    Ok(StartLine::Response {
        version,
        status,
        phrase: phrase.trim_end().to_string(),
    })
}

/// Parse header (or trailer) field lines into an ordered list, gathering
/// the transfer codings and Content-Length along the way.
///
/// Folded continuation lines join the preceding value with a single space.
/// One optional space after the colon is absorbed; everything else in the
/// value is preserved verbatim.
fn parse_fields(
    lines: &[&[u8]],
) -> Result<(Headers, Vec<String>, Option<usize>), HttpError> {
    let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut transfer_codes: Vec<String> = Vec::new();
    let mut content_length: Option<usize> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // Folded continuation of the previous field.
            let Some(last) = fields.last_mut() else {
                return Err(HttpError::BadHeader(
                    "whitespace before first header field".into(),
                ));
            };
            last.1.push(b' ');
            last.1.extend_from_slice(trim_start(line));
            continue;
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            // Field line without a colon; ignored rather than fatal.
            continue;
        };
        let name = &line[..colon];
        if name.is_empty() {
            return Err(HttpError::BadHeader("empty field name".into()));
        }
        if name.ends_with(b" ") || name.ends_with(b"\t") {
            return Err(HttpError::BadHeader(format!(
                "whitespace before colon in {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        let mut value = &line[colon + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        fields.push((name.to_vec(), value.to_vec()));
    }

    for (name, value) in &fields {
        if name.eq_ignore_ascii_case(b"transfer-encoding") {
            for code in value.split(|b| *b == b',') {
                let code = trim_bytes(code);
                if !code.is_empty() {
                    transfer_codes.push(String::from_utf8_lossy(code).to_ascii_lowercase());
                }
            }
        } else if name.eq_ignore_ascii_case(b"content-length") {
            let text = String::from_utf8_lossy(trim_bytes(value)).to_string();
            let parsed: usize = match text.parse::<u64>() {
                Ok(n) => usize::try_from(n)
                    .map_err(|_| HttpError::Framing(format!("Content-Length {text} too large")))?,
                Err(_) => {
                    return Err(HttpError::Framing(format!(
                        "malformed Content-Length '{text}'"
                    )));
                }
            };
            match content_length {
                None => content_length = Some(parsed),
                Some(existing) if existing == parsed => {}
                Some(_) => {
                    return Err(HttpError::Framing("conflicting Content-Length".into()));
                }
            }
        }
    }

    let headers = fields
        .into_iter()
        .map(|(name, value)| (Bytes::from(name), Bytes::from(value)))
        .collect();
    Ok((headers, transfer_codes, content_length))
}

fn trim_start(b: &[u8]) -> &[u8] {
    let start = b
        .iter()
        .position(|c| *c != b' ' && *c != b'\t')
        .unwrap_or(b.len());
    &b[start..]
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let line = match line.iter().position(|b| *b == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let text = std::str::from_utf8(trim_bytes(line)).ok()?;
    if text.is_empty() {
        return None;
    }
    usize::from_str_radix(text, 16).ok()
}

// ── Serialization ───────────────────────────────────────────────────────

/// Write a start line and header block: `top_line CRLF (name ": " value
/// CRLF)* CRLF`. Names are trimmed; values are emitted verbatim.
pub fn serialize_head(out: &mut BytesMut, top_line: &str, headers: &[Header]) {
    out.extend_from_slice(top_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    serialize_fields(out, headers);
    out.extend_from_slice(b"\r\n");
}

/// Frame one chunk of a chunked body. Zero-length chunks are skipped —
/// an empty chunk would terminate the body.
pub fn serialize_chunk(out: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminate a chunked body: the zero chunk, any trailers, and the final
/// CRLF.
pub fn serialize_last_chunk(out: &mut BytesMut, trailers: &[Header]) {
    out.extend_from_slice(b"0\r\n");
    serialize_fields(out, trailers);
    out.extend_from_slice(b"\r\n");
}

fn serialize_fields(out: &mut BytesMut, headers: &[Header]) {
    for (name, value) in headers {
        out.extend_from_slice(trim_bytes(name));
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
}
