//! Incremental HTTP/1.1 response parsing.
//!
//! The state machine consumes raw socket bytes as they arrive and drives
//! a [`ResponseSink`] through status/header/body callbacks, completing a
//! message as soon as its framing (Content-Length, chunked, or
//! until-close) is satisfied. Bytes past the end of one message are
//! parsed as the start of the next, which is what keeps pipelined
//! connections cheap: one read can complete several responses.
//!
//! Only response-side parsing exists here. The generator never parses
//! requests and never needs full protocol support; the parser covers
//! exactly what a load-generating client can receive.

use thiserror::Error;

/// Upper bound on the buffered status-line-plus-headers block.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parse-level failures. All are treated as connection errors by the
/// caller: the connection is counted and reconnected.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed status line")]
    BadStatusLine,

    #[error("malformed header line")]
    BadHeader,

    #[error("invalid Content-Length value")]
    BadContentLength,

    #[error("invalid chunk size")]
    BadChunkSize,

    #[error("response head exceeds {} bytes", MAX_HEAD_BYTES)]
    HeadTooLarge,

    #[error("peer closed the stream mid-response")]
    TruncatedMessage,
}

/// What the connection needs to know about a finished response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: u16,
    /// False when the peer will (or must) close the stream after this
    /// response: `Connection: close`, HTTP/1.0 without keep-alive, or an
    /// until-close body.
    pub keep_alive: bool,
}

/// Callbacks invoked while a response is parsed.
///
/// Default implementations are no-ops so callers that only care about
/// completion implement a single method.
pub trait ResponseSink {
    fn on_status(&mut self, _status: u16) {}
    fn on_header(&mut self, _name: &[u8], _value: &[u8]) {}
    fn on_body(&mut self, _chunk: &[u8]) {}
    fn on_message_complete(&mut self, _summary: &ResponseSummary) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Body,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    Trailers,
}

/// Incremental single-response parser, reused across messages.
pub struct ResponseParser {
    phase: Phase,
    head: Vec<u8>,
    line: Vec<u8>,
    status: u16,
    keep_alive: bool,
    until_close: bool,
    body_remaining: u64,
    /// Responses to HEAD requests carry headers but never a body.
    head_request: bool,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Head,
            head: Vec::new(),
            line: Vec::new(),
            status: 0,
            keep_alive: true,
            until_close: false,
            body_remaining: 0,
            head_request: false,
        }
    }

    /// Mark whether the requests on this connection are HEAD requests.
    pub fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }

    /// True between messages (safe point to drop the connection).
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Head && self.head.is_empty()
    }

    /// Feed freshly read bytes, invoking sink callbacks as messages
    /// progress and complete. Pipelined leftovers are parsed in the same
    /// call.
    pub fn feed(
        &mut self,
        mut data: &[u8],
        sink: &mut dyn ResponseSink,
    ) -> Result<(), ParseError> {
        while !data.is_empty() {
            match self.phase {
                Phase::Head => {
                    let old_len = self.head.len();
                    self.head.extend_from_slice(data);
                    match find_double_crlf(&self.head, old_len.saturating_sub(3)) {
                        Some(pos) => {
                            let head_end = pos + 4;
                            data = &data[head_end - old_len..];
                            self.head.truncate(head_end);
                            self.begin_message(sink)?;
                            if self.phase == Phase::Head {
                                // Bodyless response completed inside
                                // begin_message; continue with leftovers.
                                continue;
                            }
                        }
                        None => {
                            if self.head.len() > MAX_HEAD_BYTES {
                                return Err(ParseError::HeadTooLarge);
                            }
                            data = &[];
                        }
                    }
                }
                Phase::Body => {
                    let take = (self.body_remaining.min(data.len() as u64)) as usize;
                    let take = if self.until_close { data.len() } else { take };
                    sink.on_body(&data[..take]);
                    data = &data[take..];
                    if !self.until_close {
                        self.body_remaining -= take as u64;
                        if self.body_remaining == 0 {
                            self.complete_message(sink);
                        }
                    }
                }
                Phase::ChunkSize => {
                    if let Some(line) = take_line(&mut self.line, &mut data) {
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            self.phase = Phase::Trailers;
                        } else {
                            self.body_remaining = size;
                            self.phase = Phase::ChunkData;
                        }
                    }
                }
                Phase::ChunkData => {
                    let take = (self.body_remaining.min(data.len() as u64)) as usize;
                    sink.on_body(&data[..take]);
                    data = &data[take..];
                    self.body_remaining -= take as u64;
                    if self.body_remaining == 0 {
                        self.phase = Phase::ChunkDataEnd;
                    }
                }
                Phase::ChunkDataEnd => {
                    // The CRLF that terminates every chunk's data.
                    if let Some(line) = take_line(&mut self.line, &mut data) {
                        if !line.is_empty() {
                            return Err(ParseError::BadChunkSize);
                        }
                        self.phase = Phase::ChunkSize;
                    }
                }
                Phase::Trailers => {
                    if let Some(line) = take_line(&mut self.line, &mut data) {
                        if line.is_empty() {
                            self.complete_message(sink);
                        } else if let Some((name, value)) = split_header(&line) {
                            sink.on_header(name, value);
                        } else {
                            return Err(ParseError::BadHeader);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Signal end-of-stream. Completes an until-close body; anything else
    /// mid-message is a truncation error.
    pub fn finish(&mut self, sink: &mut dyn ResponseSink) -> Result<(), ParseError> {
        if self.phase == Phase::Body && self.until_close {
            self.complete_message(sink);
            return Ok(());
        }
        if self.is_idle() {
            return Ok(());
        }
        Err(ParseError::TruncatedMessage)
    }

    /// Parse the buffered head block and decide the body framing.
    fn begin_message(&mut self, sink: &mut dyn ResponseSink) -> Result<(), ParseError> {
        let head = std::mem::take(&mut self.head);
        // Strip the trailing blank line; the remainder is CRLF-separated.
        let head = &head[..head.len() - 4];
        let mut lines = head.split(|&b| b == b'\n').map(|l| trim_cr(l));

        let status_line = lines.next().ok_or(ParseError::BadStatusLine)?;
        let (version_minor, status) = parse_status_line(status_line)?;
        self.status = status;
        sink.on_status(status);

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut connection_close = false;
        let mut connection_keep_alive = false;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = split_header(line).ok_or(ParseError::BadHeader)?;
            sink.on_header(name, value);

            if eq_ignore_case(name, b"content-length") {
                let text = std::str::from_utf8(value).map_err(|_| ParseError::BadContentLength)?;
                let parsed = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::BadContentLength)?;
                content_length = Some(parsed);
            } else if eq_ignore_case(name, b"transfer-encoding") {
                if contains_token_ignore_case(value, b"chunked") {
                    chunked = true;
                }
            } else if eq_ignore_case(name, b"connection") {
                if contains_token_ignore_case(value, b"close") {
                    connection_close = true;
                } else if contains_token_ignore_case(value, b"keep-alive") {
                    connection_keep_alive = true;
                }
            }
        }

        self.keep_alive = if connection_close {
            false
        } else if version_minor == 0 {
            connection_keep_alive
        } else {
            true
        };
        self.until_close = false;

        let bodyless =
            self.head_request || status == 204 || status == 304 || (100..200).contains(&status);

        if bodyless {
            self.complete_message(sink);
        } else if chunked {
            self.phase = Phase::ChunkSize;
        } else if let Some(length) = content_length {
            if length == 0 {
                self.complete_message(sink);
            } else {
                self.body_remaining = length;
                self.phase = Phase::Body;
            }
        } else {
            // No framing information: the body runs until the peer
            // closes, which also means the connection cannot be reused.
            self.until_close = true;
            self.keep_alive = false;
            self.phase = Phase::Body;
        }
        Ok(())
    }

    fn complete_message(&mut self, sink: &mut dyn ResponseSink) {
        let summary = ResponseSummary {
            status: self.status,
            keep_alive: self.keep_alive,
        };
        sink.on_message_complete(&summary);
        self.phase = Phase::Head;
        self.head.clear();
        self.line.clear();
        self.status = 0;
        self.keep_alive = true;
        self.until_close = false;
        self.body_remaining = 0;
    }
}

/// Find `\r\n\r\n` starting the search at `from` (callers pass a few
/// bytes before the previous buffer end so a terminator split across
/// reads is still found).
fn find_double_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let start = from.min(buf.len() - 4);
    buf[start..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + start)
}

/// Accumulate bytes into `line` until a `\n`; returns the completed line
/// without its CRLF, consuming the used bytes from `data`.
fn take_line(line: &mut Vec<u8>, data: &mut &[u8]) -> Option<Vec<u8>> {
    match data.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            line.extend_from_slice(&data[..pos]);
            *data = &data[pos + 1..];
            let mut complete = std::mem::take(line);
            if complete.last() == Some(&b'\r') {
                complete.pop();
            }
            Some(complete)
        }
        None => {
            line.extend_from_slice(data);
            *data = &[];
            None
        }
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(&b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// `HTTP/1.x NNN reason` -> (minor version, status code).
fn parse_status_line(line: &[u8]) -> Result<(u8, u16), ParseError> {
    let rest = line
        .strip_prefix(b"HTTP/1.")
        .ok_or(ParseError::BadStatusLine)?;
    let minor = *rest.first().ok_or(ParseError::BadStatusLine)? - b'0';
    if minor > 1 {
        return Err(ParseError::BadStatusLine);
    }
    let mut fields = rest[1..].split(|&b| b == b' ').filter(|f| !f.is_empty());
    let code = fields.next().ok_or(ParseError::BadStatusLine)?;
    let text = std::str::from_utf8(code).map_err(|_| ParseError::BadStatusLine)?;
    let status = text.parse::<u16>().map_err(|_| ParseError::BadStatusLine)?;
    if !(100..600).contains(&status) {
        return Err(ParseError::BadStatusLine);
    }
    Ok((minor, status))
}

/// `Name: value` -> (name, trimmed value).
fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        value = &value[..value.len() - 1];
    }
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}

/// Hex chunk size, ignoring any `;extension`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let end = line
        .iter()
        .position(|&b| b == b';')
        .unwrap_or(line.len());
    let text = std::str::from_utf8(&line[..end]).map_err(|_| ParseError::BadChunkSize)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::BadChunkSize);
    }
    u64::from_str_radix(text, 16).map_err(|_| ParseError::BadChunkSize)
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn contains_token_ignore_case(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .map(|t| {
            let mut t = t;
            while t.first() == Some(&b' ') || t.first() == Some(&b'\t') {
                t = &t[1..];
            }
            while t.last() == Some(&b' ') || t.last() == Some(&b'\t') {
                t = &t[..t.len() - 1];
            }
            t
        })
        .any(|t| eq_ignore_case(t, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestSink {
        statuses: Vec<u16>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        completions: Vec<ResponseSummary>,
    }

    impl ResponseSink for TestSink {
        fn on_status(&mut self, status: u16) {
            self.statuses.push(status);
        }
        fn on_header(&mut self, name: &[u8], value: &[u8]) {
            self.headers.push((
                String::from_utf8_lossy(name).to_string(),
                String::from_utf8_lossy(value).to_string(),
            ));
        }
        fn on_body(&mut self, chunk: &[u8]) {
            self.body.extend_from_slice(chunk);
        }
        fn on_message_complete(&mut self, summary: &ResponseSummary) {
            self.completions.push(*summary);
        }
    }

    const SIMPLE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn test_simple_response() {
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(SIMPLE, &mut sink).unwrap();

        assert_eq!(sink.statuses, vec![200]);
        assert_eq!(sink.body, b"hello");
        assert_eq!(sink.completions.len(), 1);
        assert!(sink.completions[0].keep_alive);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        for &b in SIMPLE {
            parser.feed(&[b], &mut sink).unwrap();
        }
        assert_eq!(sink.completions.len(), 1);
        assert_eq!(sink.body, b"hello");
    }

    #[test]
    fn test_pipelined_responses_in_one_read() {
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        let two = [SIMPLE, SIMPLE].concat();
        parser.feed(&two, &mut sink).unwrap();
        assert_eq!(sink.completions.len(), 2);
        assert_eq!(sink.body, b"hellohello");
        assert!(parser.is_idle());
    }

    #[test]
    fn test_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4;ext=1\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert_eq!(sink.body, b"wikipedia");
        assert_eq!(sink.completions.len(), 1);
        assert!(sink.completions[0].keep_alive);
    }

    #[test]
    fn test_chunked_with_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3\r\nabc\r\n0\r\nExpires: never\r\n\r\n";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert_eq!(sink.body, b"abc");
        assert_eq!(sink.completions.len(), 1);
        assert!(sink
            .headers
            .iter()
            .any(|(n, v)| n == "Expires" && v == "never"));
    }

    #[test]
    fn test_connection_close_clears_keep_alive() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert!(!sink.completions[0].keep_alive);
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert!(!sink.completions[0].keep_alive);

        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert!(sink.completions[0].keep_alive);
    }

    #[test]
    fn test_until_close_body() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\npartial body";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert!(sink.completions.is_empty());

        parser.finish(&mut sink).unwrap();
        assert_eq!(sink.completions.len(), 1);
        assert!(!sink.completions[0].keep_alive);
        assert_eq!(sink.body, b"partial body");
    }

    #[test]
    fn test_truncated_length_body_is_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert!(parser.finish(&mut sink).is_err());
    }

    #[test]
    fn test_bodyless_statuses() {
        for raw in [
            &b"HTTP/1.1 204 No Content\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\nContent-Length: 20\r\n\r\n"[..],
        ] {
            let mut parser = ResponseParser::new();
            let mut sink = TestSink::default();
            parser.feed(raw, &mut sink).unwrap();
            assert_eq!(sink.completions.len(), 1, "{:?}", raw);
            assert!(sink.body.is_empty());
            assert!(parser.is_idle());
        }
    }

    #[test]
    fn test_head_request_response_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n";
        let mut parser = ResponseParser::new();
        parser.set_head_request(true);
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert_eq!(sink.completions.len(), 1);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_error_status_passes_through() {
        let raw = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        parser.feed(raw, &mut sink).unwrap();
        assert_eq!(sink.completions[0].status, 503);
    }

    #[test]
    fn test_malformed_status_line() {
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        assert!(parser
            .feed(b"ICY 200 OK\r\n\r\n", &mut sink)
            .is_err());
    }

    #[test]
    fn test_oversized_head_rejected() {
        let mut parser = ResponseParser::new();
        let mut sink = TestSink::default();
        let filler = vec![b'a'; MAX_HEAD_BYTES + 16];
        assert!(matches!(
            parser.feed(&filler, &mut sink),
            Err(ParseError::HeadTooLarge)
        ));
    }
}
