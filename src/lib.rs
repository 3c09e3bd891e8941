//! ember_web - security-first HTTP/1.1 origin server
//!
//! A self-contained origin server that accepts TCP connections, parses
//! requests by hand, serves a bounded static resource tree, accepts small
//! JSON uploads, and runs a defensive admission layer before any
//! filesystem I/O. Every byte between socket and disk is under direct
//! control: no HTTP library sits in the request path.
//!
//! # Pipeline
//!
//! ```text
//! accept loop -> bounded queue -> worker -> keep-alive connection loop
//!   per request: read head -> parse -> admission (size, host, rate)
//!                -> dispatch (GET file | POST /upload | OPTIONS)
//!                -> serialize + chunked transmit
//! ```
//!
//! # 🔒 Security & Protection
//! - **Admission before I/O** - header, URL, and body caps, Host
//!   validation, and per-IP sliding-window rate limits all run before the
//!   dispatcher touches the filesystem.
//! - **Path traversal prevention** - one percent-decode pass, segment
//!   filtering, and a canonical-root containment check; symlinks cannot
//!   escape either.
//! - **Backpressure at the edge** - a full worker queue answers `503`
//!   at accept time instead of queueing unboundedly.
//!
//! # 🏭 Operational behavior
//! - **Keep-alive budget** - at most 100 requests per connection and a
//!   30 s read timeout bound every connection's footprint.
//! - **Graceful shutdown** - SIGINT stops the accept loop, drains the
//!   queue, and joins each worker with a bounded wait.
//! - **Observability contracts** - the core emits events and counters
//!   only through the [`EventLog`] and [`MetricsSink`] traits.
//!
//! # Quick Start
//!
//! ```no_run
//! use ember_web::{NoopMetrics, Server, ServerConfig, TracingLog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::new("127.0.0.1", 8080, "./static");
//!     let server = Server::bind(config, Arc::new(TracingLog), Arc::new(NoopMetrics))
//!         .expect("startup");
//!     server.run().await;
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod connection;
    pub(crate) mod pool;
}
pub(crate) mod guard {
    pub(crate) mod host;
    pub(crate) mod path;
    pub(crate) mod rate;
}
pub(crate) mod dispatch;
pub mod errors;
pub mod limits;
pub mod observe;

pub use crate::{
    errors::StartupError,
    http::{
        request::Request,
        response::Response,
        types::{HeaderMap, Method, StatusCode, Version},
    },
    limits::{ConnLimits, RateLimits, ReqLimits, ServerConfig, ServerLimits, WaitStrategy},
    observe::{EventLog, MetricsSink, NoopMetrics, TracingLog},
    server::acceptor::{Server, ShutdownHandle},
};

/// `Server` header value: crate name and version.
pub const SERVER_ID: &str = concat!("ember_web/", env!("CARGO_PKG_VERSION"));
