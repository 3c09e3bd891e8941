//! Manual HTTP/1.1 request framing: buffered socket reads and the parser.
//!
//! One request is framed in two stages. [`ReadBuffer::read_head`]
//! accumulates bytes until the `\r\n\r\n` terminator, bounded by the header
//! cap and the read deadline. [`parse_head`] then frames the request line
//! and headers; the body is read separately with exactly `Content-Length`
//! bytes once the admission layer has cleared the request.

use crate::{
    errors::Reject,
    http::types::{self, HeaderMap, Method, Version},
    limits::ReqLimits,
};
use memchr::memmem;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::{timeout_at, Instant},
};

/// A fully framed HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) content_length: Option<usize>,
    pub(crate) body: Vec<u8>,
}

impl Request {
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target, query string included.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target's path component with the query string stripped.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Last header value with case-insensitive name matching.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The client's keep-alive preference.
    ///
    /// HTTP/1.1 defaults to keep-alive unless the `Connection` header
    /// contains the `close` token; HTTP/1.0 (and anything else) defaults
    /// to close unless it contains `keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if types::connection_has_token(value, "close") => false,
            Some(value) if types::connection_has_token(value, "keep-alive") => true,
            _ => self.version.defaults_to_keep_alive(),
        }
    }
}

/// Parses the head block (request line plus headers, terminator stripped).
///
/// Framing violations map to 400; a target over the URL cap maps to
/// [`Reject::UriTooLong`].
pub(crate) fn parse_head(head: &[u8], limits: &ReqLimits) -> Result<Request, Reject> {
    let head =
        simdutf8::basic::from_utf8(head).map_err(|_| Reject::BadRequest("non-UTF-8 request"))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(Reject::BadRequest("empty request"))?;
    let (method, target, path, version) = parse_request_line(request_line, limits)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = parse_header_line(line)?;
        headers.push(name.to_string(), value.to_string());
    }

    if let Some(value) = headers.get("transfer-encoding") {
        if !value.trim().eq_ignore_ascii_case("identity") {
            return Err(Reject::BadRequest("transfer encoding not supported"));
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => Some(
            parse_content_length(value).ok_or(Reject::BadRequest("invalid Content-Length"))?,
        ),
        None => None,
    };

    Ok(Request {
        method,
        target: target.to_string(),
        path: path.to_string(),
        version,
        headers,
        content_length,
        body: Vec::new(),
    })
}

/// `METHOD SP target SP HTTP/<d>.<d>` with exactly single spaces.
fn parse_request_line<'a>(
    line: &'a str,
    limits: &ReqLimits,
) -> Result<(Method, &'a str, &'a str, Version), Reject> {
    let mut tokens = line.split(' ');
    let (method, target, version) = match (
        tokens.next(),
        tokens.next(),
        tokens.next(),
        tokens.next(),
    ) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(Reject::BadRequest("malformed request line")),
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(Reject::BadRequest("malformed method"));
    }
    if target.is_empty() {
        return Err(Reject::BadRequest("malformed request line"));
    }
    if target.len() > limits.max_url_bytes {
        return Err(Reject::UriTooLong);
    }

    let version = parse_version(version)?;
    let path = match target.find('?') {
        Some(idx) => &target[..idx],
        None => target,
    };

    Ok((Method::from_token(method), target, path, version))
}

fn parse_version(token: &str) -> Result<Version, Reject> {
    let bytes = token.as_bytes();
    match bytes {
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
            if major.is_ascii_digit() && minor.is_ascii_digit() =>
        {
            Ok(Version {
                major: major - b'0',
                minor: minor - b'0',
            })
        }
        _ => Err(Reject::BadRequest("malformed HTTP version")),
    }
}

/// `name: value` with a tchar name and OWS-trimmed value. Obsolete line
/// folding (a continuation line starting with SP or HT) is rejected.
fn parse_header_line(line: &str) -> Result<(&str, &str), Reject> {
    if line.is_empty() {
        return Err(Reject::BadRequest("malformed header"));
    }
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(Reject::BadRequest("obsolete header folding"));
    }

    let colon = line
        .find(':')
        .ok_or(Reject::BadRequest("malformed header"))?;
    let (name, rest) = line.split_at(colon);

    if name.is_empty() || !name.bytes().all(types::is_tchar) {
        return Err(Reject::BadRequest("malformed header name"));
    }

    let value = rest[1..].trim_matches([' ', '\t']);
    Ok((name, value))
}

/// Strict `Content-Length` grammar: decimal digits only, no sign, no
/// leading zeros beyond a lone `0`.
fn parse_content_length(value: &str) -> Option<usize> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if value.len() > 1 && value.starts_with('0') {
        return None;
    }
    value.parse::<usize>().ok()
}

// Buffered socket reads

const READ_CHUNK: usize = 4096;

/// Outcome of waiting for a request head.
#[derive(Debug)]
pub(crate) enum HeadOutcome {
    /// Complete head block, `\r\n\r\n` stripped.
    Head(Vec<u8>),
    /// Peer closed or idle timeout before the first byte; close silently.
    Quiet,
    /// Timeout or EOF after a partial request arrived; a best-effort 400
    /// may still be written.
    Partial,
}

/// Per-connection read buffer. Bytes read past the current head block are
/// retained and consumed first by the body reader.
#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Accumulates until `\r\n\r\n`, the header cap, the deadline, or EOF.
    pub(crate) async fn read_head<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        limits: &ReqLimits,
        read_timeout: Duration,
    ) -> Result<HeadOutcome, Reject> {
        let deadline = Instant::now() + read_timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = memmem::find(&self.buf, b"\r\n\r\n") {
                let mut head = self.buf.split_off(pos + 4);
                std::mem::swap(&mut head, &mut self.buf);
                head.truncate(pos);
                return Ok(HeadOutcome::Head(head));
            }
            if self.buf.len() > limits.max_header_bytes {
                return Err(Reject::BadRequest("header block too large"));
            }

            match timeout_at(deadline, stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => {
                    return Ok(match self.buf.is_empty() {
                        true => HeadOutcome::Quiet,
                        false => HeadOutcome::Partial,
                    });
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(Reject::Io(e)),
            }
        }
    }

    /// Reads exactly `len` body bytes, leftover buffer first.
    pub(crate) async fn read_body<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        len: usize,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, Reject> {
        let deadline = Instant::now() + read_timeout;

        let take = len.min(self.buf.len());
        let mut body: Vec<u8> = self.buf.drain(..take).collect();

        let mut chunk = [0u8; READ_CHUNK];
        while body.len() < len {
            let want = (len - body.len()).min(READ_CHUNK);
            match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
                Err(_elapsed) => return Err(Reject::BadRequest("timed out reading body")),
                Ok(Ok(0)) => return Err(Reject::BadRequest("incomplete body")),
                Ok(Ok(n)) => body.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(Reject::Io(e)),
            }
        }

        Ok(body)
    }
}
