//! Incremental HTTP/1.x request-head sniffer.
//!
//! Only enough of HTTP is understood to route a connection: request line,
//! headers, `Host` and `Content-Length`. Bytes are accumulated across
//! [`HeadParser::feed`] calls and the head is only reported complete once the
//! blank line terminating the header block has been seen. Lines may end in
//! CRLF or a bare LF.

use crate::error::GateError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default overall deadline for a request head to arrive.
pub const DEFAULT_PARSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default cap on the size of a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Canned response sent when no relay client is connected for a hostname.
pub const BAD_GATEWAY_RESPONSE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
X-Powered-By: relaygate\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<html>\n\
  <head>\n\
    <style>\n\
      .header { color: red; text-align: center; font-size: 3rem; }\n\
      .warning { background-color: #EDE1D0; border-radius: 3px; margin: 1rem; padding: 0.5rem; font-size: 1.2rem; }\n\
    </style>\n\
  </head>\n\
  <body>\n\
    <div class=\"header\">Bad Gateway</div>\n\
    <div class=\"warning\">\n\
      There's no relay client connected for this hostname.\n\
      Start your relay client and try again.\n\
    </div>\n\
  </body>\n\
</html>\n";

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    pub version: String,
    /// Header map with lowercased names. A repeated header keeps its last value.
    pub headers: HashMap<String, String>,
    /// `Host` header value without any port suffix.
    pub host: Option<String>,
    /// `Content-Length`, absent when missing or not a valid integer.
    pub content_length: Option<u64>,
    /// Length of the head including the terminating blank line.
    pub head_len: usize,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the request asks for a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key("upgrade")
    }

    /// Whether the request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Whether the client declared `Connection: close`.
    pub fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

/// Result of feeding bytes into a [`HeadParser`].
#[derive(Debug)]
pub enum ParseOutcome {
    /// The header block is not complete yet.
    NeedMore,
    /// The full head arrived.
    Complete(RequestHead),
    /// Timed out or not an HTTP request. Terminal.
    Failed(GateError),
}

/// Accumulating request-head parser with an overall deadline.
#[derive(Debug)]
pub struct HeadParser {
    buffer: Vec<u8>,
    started: Instant,
    timeout: Duration,
    max_head_bytes: usize,
}

impl HeadParser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_PARSE_TIMEOUT, DEFAULT_MAX_HEAD_BYTES)
    }

    pub fn with_limits(timeout: Duration, max_head_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            started: Instant::now(),
            timeout,
            max_head_bytes,
        }
    }

    /// Instant after which the head is considered timed out.
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// All bytes fed so far, head and any body bytes that followed it.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    pub fn feed(&mut self, data: &[u8]) -> ParseOutcome {
        self.feed_at(data, Instant::now())
    }

    /// Feed bytes observed at `now`.
    pub fn feed_at(&mut self, data: &[u8], now: Instant) -> ParseOutcome {
        if now > self.deadline() {
            return ParseOutcome::Failed(GateError::ParseTimeout);
        }

        // The terminator (at most `\r\n\r\n`) may straddle the previous
        // chunk boundary.
        let search_from = self.buffer.len().saturating_sub(3);
        self.buffer.extend_from_slice(data);

        if let Some((end, head_len)) = find_head_end(&self.buffer, search_from) {
            if end > self.max_head_bytes {
                return ParseOutcome::Failed(self.oversized());
            }
            return match parse_head(&self.buffer[..end]) {
                Ok(mut head) => {
                    head.head_len = head_len;
                    ParseOutcome::Complete(head)
                }
                Err(e) => ParseOutcome::Failed(e),
            };
        }

        if self.buffer.len() > self.max_head_bytes {
            return ParseOutcome::Failed(self.oversized());
        }

        // Reject non-HTTP traffic as soon as the request line is readable.
        if let Some(line_end) = find(&self.buffer, b"\n") {
            let line = String::from_utf8_lossy(&self.buffer[..line_end]);
            if let Err(e) = parse_request_line(line.trim_end_matches('\r')) {
                return ParseOutcome::Failed(e);
            }
        }

        ParseOutcome::NeedMore
    }

    fn oversized(&self) -> GateError {
        GateError::ParseFailure(format!(
            "request head exceeds {} bytes",
            self.max_head_bytes
        ))
    }
}

impl Default for HeadParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Locate the blank line ending the head, looking at line feeds from
/// `from` on. Returns where the header text ends and where the body starts.
fn find_head_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        let body_start = match buf.get(i + 1) {
            Some(b'\n') => i + 2,
            Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => i + 3,
            _ => return None,
        };
        let text_end = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };
        Some((text_end, body_start))
    })
}

fn parse_request_line(line: &str) -> Result<(String, String, String), GateError> {
    let mut parts = line.split(' ');
    let (method, url, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) => (m, u, v),
        _ => {
            return Err(GateError::ParseFailure(format!(
                "malformed request line: {:?}",
                line.chars().take(80).collect::<String>()
            )))
        }
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-') {
        return Err(GateError::ParseFailure(format!("invalid method: {method:?}")));
    }
    if url.is_empty() {
        return Err(GateError::ParseFailure("empty request target".into()));
    }
    if !version.starts_with("HTTP/") {
        return Err(GateError::ParseFailure(format!("invalid version: {version:?}")));
    }

    Ok((method.to_string(), url.to_string(), version.to_string()))
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, GateError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));
    let request_line = lines.next().unwrap_or_default();
    let (method, url, version) = parse_request_line(request_line)?;

    let mut headers: HashMap<String, String> = HashMap::new();
    let mut last_name: Option<String> = None;
    for line in lines {
        // obs-fold: continuation of the previous header value
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(value) = last_name.as_ref().and_then(|n| headers.get_mut(n)) {
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            return Err(GateError::ParseFailure("continuation without header".into()));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| GateError::ParseFailure(format!("malformed header line: {line:?}")))?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(GateError::ParseFailure("empty header name".into()));
        }
        headers.insert(name.clone(), value.trim().to_string());
        last_name = Some(name);
    }

    let host = headers.get("host").map(|h| strip_port(h)).filter(|h| !h.is_empty());
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());

    Ok(RequestHead {
        method,
        url,
        version,
        headers,
        host,
        content_length,
        head_len: raw.len(),
    })
}

/// `example.com:8080` -> `example.com`, `[::1]:8080` -> `::1`.
fn strip_port(host: &str) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    host.split(':').next().unwrap_or_default().to_string()
}

/// Build a minimal `Connection: close` response.
pub fn simple_response(status: u16, reason: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}
