//! HTTP response builder: serialization into a byte buffer and chunked
//! transmission.
//!
//! A response is assembled as status + ordered headers + body, then
//! serialized once. The wire format is always HTTP/1.1. "Chunked" here
//! means the serialized buffer is sent in fixed-size slices with a full
//! `write_all` per slice; it is not `Transfer-Encoding: chunked`, and
//! `Content-Length` is always present.

use crate::http::types::StatusCode;
use std::{
    io,
    time::{Duration, SystemTime},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::sleep,
};

/// Transmit slice size in bytes.
const SEND_CHUNK: usize = 8192;

/// An HTTP response under construction.
///
/// Build by chaining: status is fixed at creation, headers accumulate in
/// insertion order, the body is set last. [`Response::serialize`] appends
/// the mandatory header set (`Date`, `Server`, `Content-Type`,
/// `Content-Length`, `Connection`, and `Keep-Alive` when the connection
/// is kept).
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    content_type: String,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_type: "text/plain; charset=utf-8".to_string(),
            body: Vec::new(),
        }
    }

    /// Plain-text error body: one line with the reason phrase and a brief
    /// diagnostic.
    pub(crate) fn error_text(status: StatusCode, diagnostic: &str) -> Self {
        let mut resp = Self::new(status);
        resp.body = format!("{}: {}\n", status.reason(), diagnostic).into_bytes();
        resp
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = value.into();
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub(crate) fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serializes status line, headers in insertion order, and body.
    ///
    /// `keep_alive` decides the `Connection` header and whether
    /// `Keep-Alive: <advertisement>` is included; the caller passes the
    /// final disposition so the header always matches what the connection
    /// handler is about to do.
    pub(crate) fn serialize(&self, keep_alive: bool, keep_alive_advert: &str) -> Vec<u8> {
        let mut wire = Vec::with_capacity(256 + self.body.len());

        wire.extend_from_slice(self.status.to_first_line());

        push_header(&mut wire, "Date", &httpdate::fmt_http_date(SystemTime::now()));
        push_header(&mut wire, "Server", crate::SERVER_ID);
        push_header(&mut wire, "Content-Type", &self.content_type);
        for (name, value) in &self.headers {
            push_header(&mut wire, name, value);
        }
        push_header(&mut wire, "Content-Length", &self.body.len().to_string());
        match keep_alive {
            true => {
                push_header(&mut wire, "Connection", "keep-alive");
                push_header(&mut wire, "Keep-Alive", keep_alive_advert);
            }
            false => push_header(&mut wire, "Connection", "close"),
        }

        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}

#[inline]
fn push_header(wire: &mut Vec<u8>, name: &str, value: &str) {
    wire.extend_from_slice(name.as_bytes());
    wire.extend_from_slice(b": ");
    wire.extend_from_slice(value.as_bytes());
    wire.extend_from_slice(b"\r\n");
}

/// Sends a serialized response in [`SEND_CHUNK`]-byte slices.
///
/// Each slice goes out with a single `write_all` bounded by the write
/// timeout; short writes are retried inside `write_all` until the slice is
/// fully sent or the socket errors.
pub(crate) async fn transmit<S: AsyncWrite + Unpin>(
    stream: &mut S,
    wire: &[u8],
    write_timeout: Duration,
) -> Result<(), io::Error> {
    for chunk in wire.chunks(SEND_CHUNK) {
        write_bytes(stream, chunk, write_timeout).await?;
    }
    stream.flush().await
}

pub(crate) async fn write_bytes<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &[u8],
    write_timeout: Duration,
) -> Result<(), io::Error> {
    tokio::select! {
        biased;

        result = stream.write_all(bytes) => result,
        _ = sleep(write_timeout) => {
            Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(wire: &[u8]) -> Vec<String> {
        let text = String::from_utf8(wire.to_vec()).unwrap();
        text.split("\r\n").map(str::to_string).collect()
    }

    fn header_value<'a>(lines: &'a [String], name: &str) -> Option<&'a str> {
        let prefix = format!("{name}: ");
        lines
            .iter()
            .find_map(|line| line.strip_prefix(&prefix))
    }

    #[test]
    fn mandatory_headers_present() {
        let wire = Response::new(StatusCode::Ok)
            .content_type("text/html; charset=utf-8")
            .body("<h1>hi</h1>")
            .serialize(true, "timeout=30, max=100");
        let lines = lines(&wire);

        assert_eq!(lines[0], "HTTP/1.1 200 OK");
        assert!(header_value(&lines, "Date").is_some());
        assert_eq!(header_value(&lines, "Server"), Some(crate::SERVER_ID));
        assert_eq!(
            header_value(&lines, "Content-Type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(header_value(&lines, "Content-Length"), Some("11"));
        assert_eq!(header_value(&lines, "Connection"), Some("keep-alive"));
        assert_eq!(
            header_value(&lines, "Keep-Alive"),
            Some("timeout=30, max=100")
        );
        assert!(lines.last().unwrap().ends_with("<h1>hi</h1>"));
    }

    #[test]
    fn close_disposition_omits_keep_alive() {
        let wire = Response::new(StatusCode::BadRequest).serialize(false, "timeout=30, max=100");
        let lines = lines(&wire);

        assert_eq!(header_value(&lines, "Connection"), Some("close"));
        assert!(header_value(&lines, "Keep-Alive").is_none());
    }

    #[test]
    fn date_is_rfc_1123() {
        let wire = Response::new(StatusCode::Ok).serialize(false, "");
        let lines = lines(&wire);
        let date = header_value(&lines, "Date").unwrap();

        // e.g. "Sat, 01 Aug 2026 12:00:00 GMT"
        assert!(date.ends_with(" GMT"), "date: {date}");
        assert_eq!(date.len(), 29, "date: {date}");
        assert!(httpdate::parse_http_date(date).is_ok());
    }

    #[test]
    fn custom_headers_keep_insertion_order() {
        let wire = Response::new(StatusCode::Ok)
            .header("Allow", "GET, POST, OPTIONS")
            .header("Retry-After", "1")
            .serialize(false, "");
        let text = String::from_utf8(wire).unwrap();

        let allow = text.find("Allow:").unwrap();
        let retry = text.find("Retry-After:").unwrap();
        assert!(allow < retry);
    }

    #[test]
    fn error_text_body_shape() {
        let resp = Response::error_text(StatusCode::Forbidden, "host not allowed");
        let wire = resp.serialize(false, "");
        let text = String::from_utf8(wire).unwrap();

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.ends_with("Forbidden: host not allowed\n"));
    }

    #[tokio::test]
    async fn transmit_sends_multi_chunk_payloads_whole() {
        let payload = vec![0xabu8; SEND_CHUNK * 2 + 17];
        let mut sink = Vec::new();
        transmit(&mut sink, &payload, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sink, payload);
    }
}
