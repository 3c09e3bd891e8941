//! Server configuration: limits, timeouts, and the site layout.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Slowloris attacks
//! - Header flooding
//! - Path and Host header abuse
//!
//! Every limit is enforced before the corresponding bytes are acted upon:
//! the header cap while reading, the URL cap while parsing, the body cap
//! before the body is read.

use crate::errors::StartupError;
use std::{collections::HashSet, path::PathBuf, time::Duration};

/// Controls server-level concurrency and queueing behavior.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Room in queue? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \/
/// [----------------------------------------]
/// [ Idle worker pops and runs a connection ]
/// [----------------------------------------]
/// ```
///
/// The queue acts as a buffer between connection acceptance and processing.
/// Workers continuously poll the queue using the configured `wait_strategy`.
/// A full queue is answered with an immediate `503` at accept time, so
/// accepted work always has a reserved slot.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of long-lived worker tasks (default: `10`).
    ///
    /// Each worker services exactly one connection at a time.
    pub workers: usize,

    /// Capacity of the bounded admission queue (default: `25`).
    ///
    /// Submission never waits: when the queue is full the connection is
    /// shed with `503 Service Unavailable` and closed.
    pub queue_capacity: usize,

    /// Strategy for worker waiting behavior when the queue is empty
    /// (default: `Sleep(5ms)`).
    ///
    /// The poll interval doubles as the shutdown-responsiveness bound:
    /// a worker notices the stop signal on its next empty poll.
    pub wait_strategy: WaitStrategy,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 25,
            wait_strategy: WaitStrategy::Sleep(Duration::from_millis(5)),
        }
    }
}

/// Strategy for worker task waiting when no connections are queued.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Burns CPU for the
    /// lowest possible pickup latency.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`].
    Sleep(Duration),
}

/// Connection-level limits and timeouts.
///
/// Together these bound a connection's resource footprint: no connection
/// outlives `max_requests_per_connection` requests, and no read blocks
/// longer than `socket_read_timeout`.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for request bytes (default: `30 seconds`).
    ///
    /// Applies both while idle between keep-alive requests and as the
    /// per-request deadline once the first byte arrives. The primary
    /// mechanism for cleaning up stalled connections.
    pub socket_read_timeout: Duration,

    /// Maximum duration for a single socket write (default: `10 seconds`).
    ///
    /// Applies per transmitted chunk. A timed-out write terminates the
    /// connection.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests per keep-alive connection (default: `100`).
    ///
    /// After this many responses the server closes the connection and says
    /// so with `Connection: close`.
    pub max_requests_per_connection: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(10),
            max_requests_per_connection: 100,
        }
    }
}

impl ConnLimits {
    /// Value of the `Keep-Alive` header advertised when a connection is kept.
    pub(crate) fn keep_alive_header(&self) -> String {
        format!(
            "timeout={}, max={}",
            self.socket_read_timeout.as_secs(),
            self.max_requests_per_connection
        )
    }
}

/// HTTP request parsing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus headers in bytes
    /// (default: `8192`).
    ///
    /// Enforced while reading: accumulation stops as soon as the cap is
    /// crossed without a `\r\n\r\n` terminator.
    pub max_header_bytes: usize,

    /// Maximum length of the request target in bytes (default: `2048`).
    pub max_url_bytes: usize,

    /// Maximum request body size in bytes (default: `1 MiB`).
    ///
    /// Checked against `Content-Length` before any body byte is read.
    pub max_body_bytes: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8192,
            max_url_bytes: 2048,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Per-client-IP rate limiting configuration.
///
/// Two sliding windows: a long window that triggers a hard block when
/// exhausted, and a short burst window that denies without blocking.
#[derive(Debug, Clone)]
pub struct RateLimits {
    /// Requests allowed per `window_seconds` (default: `100`).
    pub requests_per_window: usize,
    /// Length of the main sliding window (default: `60`).
    pub window_seconds: u64,
    /// Requests allowed per `burst_seconds` (default: `20`).
    pub burst_requests: usize,
    /// Length of the burst window (default: `1`).
    pub burst_seconds: u64,
    /// Duration of the hard block once the main window is exhausted
    /// (default: `30`).
    pub block_seconds: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_seconds: 60,
            burst_requests: 20,
            burst_seconds: 1,
            block_seconds: 30,
        }
    }
}

/// Aggregate configuration for one server instance. Immutable for a run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind (default: `127.0.0.1`).
    pub host: String,
    /// Port to bind (default: `8080`).
    pub port: u16,
    /// Directory the server serves files from. Must exist and be readable.
    pub resource_root: PathBuf,
    pub server: ServerLimits,
    pub conn: ConnLimits,
    pub req: ReqLimits,
    pub rate: RateLimits,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16, resource_root: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            resource_root: resource_root.into(),
            server: ServerLimits::default(),
            conn: ConnLimits::default(),
            req: ReqLimits::default(),
            rate: RateLimits::default(),
        }
    }
}

/// Validated, canonicalized site layout derived from [`ServerConfig`] at
/// startup. Shared read-only by every worker.
#[derive(Debug)]
pub struct SiteConfig {
    /// Canonical resource root. All resolved paths must stay beneath it.
    pub resource_root: PathBuf,
    /// Canonical upload directory, a child of the resource root.
    pub upload_dir: PathBuf,
    /// Lowercased hosts accepted by the Host validator.
    pub allowed_hosts: HashSet<String>,
    /// Port the Host validator matches an explicit `host:port` against.
    pub port: u16,
    /// Content types for extensions beyond the built-in table,
    /// `extension (no dot) -> content type`.
    pub extra_content_types: Vec<(String, String)>,
}

impl SiteConfig {
    /// Validates the resource tree and builds the canonical layout.
    ///
    /// The upload directory is created if absent; a missing or unreadable
    /// resource root is a startup failure.
    pub fn prepare(config: &ServerConfig) -> Result<Self, StartupError> {
        let resource_root = std::fs::canonicalize(&config.resource_root)
            .map_err(|_| StartupError::ResourceRoot(config.resource_root.clone()))?;
        if !resource_root.is_dir() {
            return Err(StartupError::ResourceRoot(config.resource_root.clone()));
        }

        let upload_dir = resource_root.join("uploads");
        std::fs::create_dir_all(&upload_dir)
            .map_err(|e| StartupError::UploadDir(upload_dir.clone(), e))?;
        let upload_dir = std::fs::canonicalize(&upload_dir)
            .map_err(|e| StartupError::UploadDir(upload_dir.clone(), e))?;

        let mut allowed_hosts = HashSet::new();
        allowed_hosts.insert(config.host.to_ascii_lowercase());
        allowed_hosts.insert("localhost".to_string());
        allowed_hosts.insert("127.0.0.1".to_string());

        Ok(Self {
            resource_root,
            upload_dir,
            allowed_hosts,
            port: config.port,
            extra_content_types: Vec::new(),
        })
    }

    /// Looks up a configured content type for an extension not covered by
    /// the built-in table.
    pub(crate) fn extra_content_type(&self, extension: &str) -> Option<&str> {
        self.extra_content_types
            .iter()
            .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
            .map(|(_, ty)| ty.as_str())
    }

    /// The path `GET /` serves.
    pub(crate) fn index_file(&self) -> PathBuf {
        self.resource_root.join("index.html")
    }
}
