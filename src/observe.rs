//! Logging and metrics contracts.
//!
//! The core never writes to a sink directly: it emits events through
//! [`EventLog`] and counters through [`MetricsSink`]. The binary installs
//! [`TracingLog`] (backed by the `tracing` ecosystem, `RUST_LOG`
//! controlled) and a no-op metrics sink; tests inject recording fakes.
//! Both traits are expected to be thread-safe; the core calls them without
//! additional locking.

use std::time::Duration;
use tracing::{error, info, warn};

/// One line per finished request.
#[derive(Debug, Clone)]
pub struct RequestRecord<'a> {
    pub request_id: &'a str,
    pub client: &'a str,
    pub method: &'a str,
    pub target: &'a str,
    pub status: u16,
    pub bytes: usize,
    pub duration: Duration,
}

/// An admission rejection with probable attack intent.
#[derive(Debug, Clone)]
pub struct SecurityViolation<'a> {
    pub client: &'a str,
    pub request_line: &'a str,
    pub reason: &'a str,
}

/// Event sink the request pipeline reports into.
pub trait EventLog: Send + Sync {
    /// INFO: a request finished (any status).
    fn request(&self, record: &RequestRecord<'_>);

    /// WARN: an admission check rejected a request.
    fn admission_rejected(&self, client: &str, reason: &str);

    /// ERROR: an I/O failure terminated a connection.
    fn io_error(&self, client: &str, context: &str);

    /// Dedicated channel for 403s from the Host and Path validators and
    /// for fresh rate-limit blocks.
    fn security_violation(&self, violation: &SecurityViolation<'_>);
}

/// Counter and gauge sink.
pub trait MetricsSink: Send + Sync {
    fn request_finished(&self, status: u16, duration: Duration, response_bytes: usize);
    fn admission_rejected(&self, reason: &str);
    fn pool_submission_rejected(&self);
    fn pool_queue_depth(&self, depth: usize);
    fn pool_active_workers(&self, active: usize);
}

/// Default [`EventLog`]: structured events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingLog;

impl EventLog for TracingLog {
    fn request(&self, r: &RequestRecord<'_>) {
        info!(
            request_id = r.request_id,
            client = r.client,
            method = r.method,
            target = r.target,
            status = r.status,
            bytes = r.bytes,
            duration_ms = r.duration.as_millis() as u64,
            "request"
        );
    }

    fn admission_rejected(&self, client: &str, reason: &str) {
        warn!(client, reason, "admission rejected");
    }

    fn io_error(&self, client: &str, context: &str) {
        error!(client, context, "connection i/o error");
    }

    fn security_violation(&self, v: &SecurityViolation<'_>) {
        warn!(
            client = v.client,
            request_line = v.request_line,
            reason = v.reason,
            "SECURITY_VIOLATION"
        );
    }
}

/// Default [`MetricsSink`]: discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn request_finished(&self, _: u16, _: Duration, _: usize) {}
    fn admission_rejected(&self, _: &str) {}
    fn pool_submission_rejected(&self) {}
    fn pool_queue_depth(&self, _: usize) {}
    fn pool_active_workers(&self, _: usize) {}
}

/// Eight random alphanumeric characters identifying one request in logs.
pub(crate) fn request_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}
