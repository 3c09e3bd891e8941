//! Per-connection keep-alive loop.
//!
//! One worker owns one accepted socket at a time and drives it through
//! read-head, parse, admission, read-body, dispatch, write, decide. All
//! rejection paths converge on a single mapper from [`Reject`] to a
//! response plus a keep/close disposition, so the `Connection` header
//! always matches what the loop is about to do.

use crate::{
    dispatch,
    errors::Reject,
    guard,
    http::{
        request::{parse_head, HeadOutcome, ReadBuffer, Request},
        response::{self, Response},
        types::{Method, StatusCode, ALLOWED_METHODS},
    },
    limits::{ConnLimits, ReqLimits, SiteConfig},
    observe::{self, EventLog, MetricsSink, RequestRecord, SecurityViolation},
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};

/// Everything a worker needs to serve connections. Built once at startup,
/// shared read-only; the rate limiter carries its own lock.
pub(crate) struct Shared {
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) site: SiteConfig,
    pub(crate) rate: guard::rate::RateLimiter,
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) keep_alive_advert: String,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// Runs the keep-alive loop until the connection closes.
///
/// Requests on one connection are processed strictly in arrival order;
/// the response is fully written before the next head is read.
pub(crate) async fn serve<S>(shared: &Shared, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client = peer.to_string();
    let mut buffer = ReadBuffer::new();
    let mut served: usize = 0;

    loop {
        let head = match buffer
            .read_head(&mut stream, &shared.req, shared.conn.socket_read_timeout)
            .await
        {
            Ok(HeadOutcome::Head(head)) => head,
            // No bytes: the client left or idled out. Close silently.
            Ok(HeadOutcome::Quiet) => break,
            // A partial request arrived, then the socket stalled or
            // half-closed: best-effort 400, then close.
            Ok(HeadOutcome::Partial) => {
                let wire = Response::error_text(StatusCode::BadRequest, "incomplete request")
                    .serialize(false, &shared.keep_alive_advert);
                let _ = response::transmit(
                    &mut stream,
                    &wire,
                    shared.conn.socket_write_timeout,
                )
                .await;
                break;
            }
            Err(Reject::Io(_)) => {
                shared.log.io_error(&client, "reading request head");
                break;
            }
            Err(reject) => {
                // Oversized header block: answer and close.
                finish_rejected(shared, &mut stream, &client, None, reject).await;
                break;
            }
        };

        let started = Instant::now();
        let request_id = observe::request_id();

        let (request, result) = process(shared, &mut stream, &mut buffer, &head, peer).await;

        let (response, reject_closes) = match result {
            Ok(response) => (response, false),
            Err(Reject::Io(_)) => {
                shared.log.io_error(&client, "reading request body");
                break;
            }
            Err(reject) => {
                report_rejection(shared, &client, request.as_ref(), &reject);
                (rejection_response(&reject), reject.closes_connection())
            }
        };

        // DECIDING: keep only while the request budget, the client, and
        // the server itself all agree.
        let client_keep = request.as_ref().map(Request::wants_keep_alive).unwrap_or(false);
        let within_budget = served + 1 < shared.conn.max_requests_per_connection;
        let shutting_down = *shared.shutdown.borrow();
        let keep = !reject_closes && client_keep && within_budget && !shutting_down;

        let wire = response.serialize(keep, &shared.keep_alive_advert);
        if response::transmit(&mut stream, &wire, shared.conn.socket_write_timeout)
            .await
            .is_err()
        {
            shared.log.io_error(&client, "writing response");
            break;
        }

        let (method, target) = match request.as_ref() {
            Some(req) => (req.method().as_str(), req.target()),
            None => ("-", "-"),
        };
        shared.log.request(&RequestRecord {
            request_id: &request_id,
            client: &client,
            method,
            target,
            status: response.status().as_u16(),
            bytes: wire.len(),
            duration: started.elapsed(),
        });
        shared
            .metrics
            .request_finished(response.status().as_u16(), started.elapsed(), wire.len());

        if !keep {
            break;
        }
        served += 1;
    }
}

/// Parse, method gate, size gate, body read, host and rate admission,
/// dispatch. Returns the request (when one was parsed) so the caller can
/// log it and honor its keep-alive preference.
async fn process<S>(
    shared: &Shared,
    stream: &mut S,
    buffer: &mut ReadBuffer,
    head: &[u8],
    peer: SocketAddr,
) -> (Option<Request>, Result<Response, Reject>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = match parse_head(head, &shared.req) {
        Ok(request) => request,
        Err(reject) => return (None, Err(reject)),
    };

    if let Method::Other(_) = request.method() {
        return (Some(request), Err(Reject::MethodNotAllowed));
    }

    // Size admission: the declared body must fit before a byte is read.
    let body_len = request.content_length().unwrap_or(0);
    if body_len > shared.req.max_body_bytes {
        return (Some(request), Err(Reject::BodyTooLarge));
    }
    if body_len > 0 {
        match buffer
            .read_body(stream, body_len, shared.conn.socket_read_timeout)
            .await
        {
            Ok(body) => request.body = body,
            Err(reject) => return (Some(request), Err(reject)),
        }
    }

    if let Err(reject) = guard::host::validate(&request, &shared.site) {
        return (Some(request), Err(reject));
    }

    if let Err(denial) = shared.rate.is_allowed(peer.ip(), Instant::now()) {
        // A fresh block is reported once, on the transition.
        if denial.is_block() {
            shared.log.security_violation(&SecurityViolation {
                client: &peer.to_string(),
                request_line: &request_line(&request),
                reason: denial.reason(),
            });
        }
        return (
            Some(request),
            Err(Reject::RateLimited(denial.retry_after())),
        );
    }

    let result = dispatch::dispatch(&request, &shared.site).await;
    (Some(request), result)
}

/// The central mapper from a rejection to its wire response.
fn rejection_response(reject: &Reject) -> Response {
    let mut response = Response::error_text(reject.status(), reject.diagnostic());
    match reject {
        Reject::MethodNotAllowed => response = response.header("Allow", ALLOWED_METHODS),
        Reject::RateLimited(retry_after) => {
            response = response.header("Retry-After", retry_after.to_string())
        }
        _ => {}
    }
    response
}

fn report_rejection(shared: &Shared, client: &str, request: Option<&Request>, reject: &Reject) {
    shared.log.admission_rejected(client, reject.diagnostic());
    shared.metrics.admission_rejected(reject.diagnostic());

    if reject.is_security_violation() {
        let line = request.map(request_line).unwrap_or_else(|| "-".to_string());
        shared.log.security_violation(&SecurityViolation {
            client,
            request_line: &line,
            reason: reject.diagnostic(),
        });
    }
}

async fn finish_rejected<S>(
    shared: &Shared,
    stream: &mut S,
    client: &str,
    request: Option<&Request>,
    reject: Reject,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    report_rejection(shared, client, request, &reject);
    let wire = rejection_response(&reject).serialize(false, &shared.keep_alive_advert);
    let _ = response::transmit(stream, &wire, shared.conn.socket_write_timeout).await;
}

fn request_line(request: &Request) -> String {
    format!(
        "{} {} HTTP/{}.{}",
        request.method().as_str(),
        request.target(),
        request.version().major,
        request.version().minor
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        guard::rate::RateLimiter,
        limits::{RateLimits, ServerConfig},
        observe::test_support::RecordingLog,
    };
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "198.51.100.20:40000".parse().unwrap()
    }

    struct Fixture {
        _root: TempDir,
        shared: Arc<Shared>,
        log: Arc<RecordingLog>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        fixture_with(RateLimits::default(), ConnLimits::default())
    }

    fn fixture_with(rate: RateLimits, conn: ConnLimits) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(root.path().join("logo.png"), [1u8, 2, 3, 4]).unwrap();

        let site = SiteConfig::prepare(&ServerConfig::new("127.0.0.1", 8080, root.path())).unwrap();
        let (tx, rx) = watch::channel(false);
        let log = Arc::new(RecordingLog::default());
        let keep_alive_advert = conn.keep_alive_header();

        Fixture {
            _root: root,
            shared: Arc::new(Shared {
                conn,
                req: ReqLimits::default(),
                site,
                rate: RateLimiter::new(rate),
                log: log.clone(),
                metrics: Arc::new(crate::observe::NoopMetrics),
                keep_alive_advert,
                shutdown: rx,
            }),
            log,
            _shutdown_tx: tx,
        }
    }

    /// Drives the connection loop with raw client bytes and returns
    /// everything the server wrote.
    async fn exchange(fixture: &Fixture, input: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        serve(&fixture.shared, server, peer()).await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn get_root_serves_index_with_keep_alive() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(reply.contains("Connection: keep-alive\r\n"));
        assert!(reply.contains("Keep-Alive: timeout=30, max=100\r\n"));
        assert!(reply.ends_with("<h1>home</h1>"));
    }

    #[tokio::test]
    async fn binary_download() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"GET /logo.png HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Content-Type: application/octet-stream\r\n"));
        assert!(reply.contains("Content-Disposition: attachment; filename=\"logo.png\"\r\n"));
    }

    #[tokio::test]
    async fn traversal_blocked_with_one_violation_event() {
        let fixture = fixture();
        let reply =
            exchange(&fixture, b"GET /../etc/passwd HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n")
                .await;

        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(reply.contains("Connection: keep-alive\r\n"));

        let violations = fixture.log.violations.lock().unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("traversal") || violations[0].contains("path"));
    }

    #[tokio::test]
    async fn host_mismatch_is_forbidden_and_closes() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"GET / HTTP/1.1\r\nHost: evil.com\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert_eq!(fixture.log.violations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn unsupported_method_gets_allow_header() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"PUT / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(reply.contains("Allow: GET, POST, OPTIONS\r\n"));
        assert!(reply.contains("Connection: keep-alive\r\n"));
    }

    #[tokio::test]
    async fn json_upload_created() {
        let fixture = fixture();
        let reply = exchange(
            &fixture,
            b"POST /upload HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"hello\":\"world\"}",
        )
        .await;

        assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"));
        let body_start = reply.find("\r\n\r\n").unwrap() + 4;
        let receipt: serde_json::Value = serde_json::from_str(&reply[body_start..]).unwrap();
        assert_eq!(receipt["status"], "created");

        let filepath = receipt["filepath"].as_str().unwrap();
        let name = filepath.strip_prefix("/uploads/").unwrap();
        let stored = fs::read_to_string(fixture.shared.site.upload_dir.join(name)).unwrap();
        assert_eq!(stored, "{\"hello\":\"world\"}");
    }

    #[tokio::test]
    async fn upload_with_wrong_media_type() {
        let fixture = fixture();
        let reply = exchange(
            &fixture,
            b"POST /upload HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 415 Unsupported Media Type\r\n"));
    }

    #[tokio::test]
    async fn oversized_declared_body_is_rejected_before_read() {
        let fixture = fixture();
        let declared = fixture.shared.req.max_body_bytes + 1;
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nContent-Type: application/json\r\nContent-Length: {declared}\r\n\r\n"
        );
        let reply = exchange(&fixture, head.as_bytes()).await;

        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn two_requests_on_one_connection_then_half_close() {
        let fixture = fixture();
        let reply = exchange(
            &fixture,
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\nGET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;

        let first = reply.find("HTTP/1.1 200 OK").unwrap();
        let second = reply.rfind("HTTP/1.1 200 OK").unwrap();
        assert_ne!(first, second, "expected two responses");
        assert!(reply.contains("Connection: keep-alive\r\n"));
        assert!(reply.contains("Connection: close\r\n"));

        let requests = fixture.log.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn request_budget_closes_connection() {
        let conn = ConnLimits {
            max_requests_per_connection: 2,
            ..ConnLimits::default()
        };
        let fixture = fixture_with(RateLimits::default(), conn);

        let mut input = Vec::new();
        for _ in 0..3 {
            input.extend_from_slice(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        }
        let reply = exchange(&fixture, &input).await;

        // The second response exhausts the budget and carries
        // `Connection: close`; the third request is never served.
        assert_eq!(reply.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(reply.contains("Connection: close\r\n"));
        assert_eq!(fixture.log.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let fixture = fixture();
        let reply = exchange(&fixture, b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert!(!reply.contains("Keep-Alive:"));
    }

    #[tokio::test]
    async fn burst_rate_limit_answers_429() {
        let rate = RateLimits {
            burst_requests: 1,
            burst_seconds: 60,
            ..RateLimits::default()
        };
        let fixture = fixture_with(rate, ConnLimits::default());

        let reply = exchange(
            &fixture,
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\nGET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;

        assert!(reply.contains("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(reply.contains("Retry-After: 60\r\n"));
        // Rate rejections keep the connection.
        assert_eq!(fixture.log.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chunked_transfer_encoding_rejected() {
        let fixture = fixture();
        let reply = exchange(
            &fixture,
            b"POST /upload HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn partial_request_gets_best_effort_400() {
        let conn = ConnLimits {
            socket_read_timeout: std::time::Duration::from_millis(100),
            ..ConnLimits::default()
        };
        let fixture = fixture_with(RateLimits::default(), conn);

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"GET /half").await.unwrap();

        serve(&fixture.shared, server, peer()).await;

        let mut out = vec![0u8; 1024];
        let n = client.read(&mut out).await.unwrap();
        let reply = String::from_utf8_lossy(&out[..n]).to_string();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn idle_close_is_silent() {
        let conn = ConnLimits {
            socket_read_timeout: std::time::Duration::from_millis(50),
            ..ConnLimits::default()
        };
        let fixture = fixture_with(RateLimits::default(), conn);

        let (mut client, server) = tokio::io::duplex(1024);
        serve(&fixture.shared, server, peer()).await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert!(fixture.log.requests.lock().unwrap().is_empty());
    }
}
