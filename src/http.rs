use crate::buffer::RecvBuffer;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpParseError {
    #[error("bad request line")]
    BadRequestLine,
    #[error("unsupported HTTP version {0:?}")]
    UnsupportedVersion(String),
    #[error("bad header line")]
    BadHeaderLine,
    #[error("bad header key")]
    BadHeaderKey,
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("body of {0} bytes is too large")]
    BodyTooLarge(u64),
    #[error("request line or header is not valid UTF-8")]
    InvalidEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Longest request or header line, CRLF excluded.
    pub max_line_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 8 * 1024,
            max_body_bytes: 1 << 20,
        }
    }
}

impl ParserLimits {
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Keys are lowercase. A repeated header keeps its last value.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `Connection: close` was sent.
    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|value| value.to_ascii_lowercase().contains("close"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    /// Emitted in insertion order. `Content-Length` and `Connection` are always generated by `to_bytes`.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Insert or replace (case-insensitively) a header.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
        self
    }

    pub fn set_text_body(&mut self, text: &str) -> &mut Self {
        self.set_header("Content-Type", "text/plain; charset=utf-8");
        self.body = text.as_bytes().to_vec();
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>) -> &mut Self {
        self.body = body;
        self
    }

    pub fn to_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
}

/// Incremental HTTP/1.x request parser bound to one connection.
///
/// Every `try_parse` first moves everything readable out of the recv buffer into its own
/// accumulation buffer, so the recv buffer never fills up behind a slow request. Pipelined
/// requests are returned one per call.
///
/// After an error the parser is poisoned: it returns the same error until `reset`.
pub struct HttpParser {
    buf: Vec<u8>,
    state: ParseState,
    current: HttpRequest,
    content_length: usize,
    limits: ParserLimits,
    failed: Option<HttpParseError>,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

impl HttpParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            buf: Vec::new(),
            state: ParseState::RequestLine,
            current: HttpRequest::default(),
            content_length: 0,
            limits,
            failed: None,
        }
    }

    /// `Ok(Some(_))`: one complete request. `Ok(None)`: wait for more bytes.
    pub fn try_parse(&mut self, rb: &mut RecvBuffer) -> Result<Option<HttpRequest>, HttpParseError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let result = self.advance(rb);
        if let Err(err) = &result {
            self.failed = Some(err.clone());
        }
        result
    }

    /// Drop buffered bytes, the partial request and any error.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ParseState::RequestLine;
        self.current = HttpRequest::default();
        self.content_length = 0;
        self.failed = None;
    }

    /// Bytes pulled from the recv buffer but not parsed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn advance(&mut self, rb: &mut RecvBuffer) -> Result<Option<HttpRequest>, HttpParseError> {
        self.pull(rb);
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = self.pop_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        continue; // stray CRLF between requests
                    }
                    self.parse_request_line(&line)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = self.pop_line()? else {
                        return Ok(None);
                    };
                    if !line.is_empty() {
                        self.parse_header_line(&line)?;
                        continue;
                    }
                    self.content_length = self.declared_length()?;
                    if self.content_length == 0 {
                        return Ok(Some(self.finish()));
                    }
                    self.state = ParseState::Body;
                }
                ParseState::Body => {
                    if self.buf.len() < self.content_length {
                        if self.pull(rb) {
                            continue;
                        }
                        return Ok(None);
                    }
                    let rest = self.buf.split_off(self.content_length);
                    self.current.body = std::mem::replace(&mut self.buf, rest);
                    return Ok(Some(self.finish()));
                }
            }
        }
    }

    fn pull(&mut self, rb: &mut RecvBuffer) -> bool {
        let Ok((head, tail)) = rb.as_slices() else {
            return false;
        };
        let pulled = head.len() + tail.len();
        if pulled == 0 {
            return false;
        }
        self.buf.extend_from_slice(head);
        self.buf.extend_from_slice(tail);
        rb.consume(pulled).is_ok()
    }

    fn pop_line(&mut self) -> Result<Option<String>, HttpParseError> {
        let max = self.limits.max_line_bytes;
        let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") else {
            if self.buf.len() > max + 1 {
                return Err(HttpParseError::LineTooLong(max));
            }
            return Ok(None);
        };
        if pos > max {
            return Err(HttpParseError::LineTooLong(max));
        }
        let mut line: Vec<u8> = self.buf.drain(..pos + 2).collect();
        line.truncate(pos);
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| HttpParseError::InvalidEncoding)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpParseError::BadRequestLine);
        };
        if method.is_empty() || target.is_empty() || version.is_empty() {
            return Err(HttpParseError::BadRequestLine);
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(HttpParseError::UnsupportedVersion(version.to_string()));
        }
        self.current.method = method.to_string();
        self.current.target = target.to_string();
        self.current.version = version.to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let Some((key, value)) = line.split_once(':') else {
            return Err(HttpParseError::BadHeaderLine);
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(HttpParseError::BadHeaderKey);
        }
        self.current.headers.insert(key, value.trim().to_string());
        Ok(())
    }

    fn declared_length(&self) -> Result<usize, HttpParseError> {
        let Some(value) = self.current.headers.get("content-length") else {
            return Ok(0);
        };
        let len: u64 = value
            .trim()
            .parse()
            .map_err(|_| HttpParseError::InvalidContentLength(value.clone()))?;
        if len > self.limits.max_body_bytes as u64 {
            return Err(HttpParseError::BodyTooLarge(len));
        }
        Ok(len as usize)
    }

    fn finish(&mut self) -> HttpRequest {
        self.state = ParseState::RequestLine;
        self.content_length = 0;
        std::mem::take(&mut self.current)
    }
}
