//! Listener setup and the accept loop.
//!
//! One task accepts connections and hands each to the worker pool with an
//! immediate submission. A full queue is answered on the spot with a
//! minimal `503` and the socket is closed: shedding happens at the edge,
//! so accepted work always has a reserved slot and the pool stays live.

use crate::{
    errors::StartupError,
    guard::rate::RateLimiter,
    http::response,
    limits::{ServerConfig, SiteConfig},
    observe::{EventLog, MetricsSink},
    server::{
        connection::Shared,
        pool::{ConnTask, WorkerPool},
    },
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

const LISTEN_BACKLOG: i32 = 128;

/// Canned response for queue-overflow shedding. Written directly by the
/// accept loop, bounded by the write timeout.
const SHED_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 19\r\n\
Connection: close\r\n\
Retry-After: 1\r\n\
\r\n\
Service Unavailable";

/// One server instance: listener, worker pool, and shared state.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: WorkerPool,
    shared: Arc<Shared>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

/// Triggers a graceful stop from outside the accept loop (tests, embedders).
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Server {
    /// Binds the listener (address reuse on, backlog ≥ 50), validates the
    /// resource tree, and starts the worker pool. Nothing is accepted
    /// until [`Server::run`].
    pub fn bind(
        config: ServerConfig,
        log: Arc<dyn EventLog>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, StartupError> {
        let mut site = SiteConfig::prepare(&config)?;

        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|_| StartupError::InvalidArg(format!("host: {}", config.host)))?;
        let addr = SocketAddr::new(ip, config.port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(StartupError::Bind)?;
        socket.set_reuse_address(true).map_err(StartupError::Bind)?;
        socket.bind(&addr.into()).map_err(StartupError::Bind)?;
        socket.listen(LISTEN_BACKLOG).map_err(StartupError::Bind)?;
        socket.set_nonblocking(true).map_err(StartupError::Bind)?;

        let listener =
            TcpListener::from_std(socket.into()).map_err(StartupError::Bind)?;
        let local_addr = listener.local_addr().map_err(StartupError::Bind)?;
        // Binding port 0 picks an ephemeral port; the Host validator must
        // match what clients actually dial.
        site.port = local_addr.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let keep_alive_advert = config.conn.keep_alive_header();
        let shared = Arc::new(Shared {
            conn: config.conn.clone(),
            req: config.req.clone(),
            site,
            rate: RateLimiter::new(config.rate.clone()),
            log,
            metrics,
            keep_alive_advert,
            shutdown: shutdown_rx.clone(),
        });
        let pool = WorkerPool::start(&config.server, shared.clone(), shutdown_rx);

        Ok(Self {
            listener,
            local_addr,
            pool,
            shared,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accepts until SIGINT or [`ShutdownHandle::shutdown`], then stops
    /// accepting, drains the pool, and joins the workers (bounded).
    pub async fn run(mut self) {
        info!(addr = %self.local_addr, "listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "signal listener failed");
                    }
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    self.shared.metrics.pool_queue_depth(self.pool.queue_depth());
                    if let Err(task) = self.pool.try_submit(ConnTask { stream, peer }) {
                        self.shed(task).await;
                    }
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        let counters = self.pool.counters();
        info!(
            completed = counters.completed,
            failed = counters.failed,
            "draining workers"
        );
        self.pool.join(true).await;
    }

    /// Queue full: 503 straight from the accept loop, then close.
    async fn shed(&self, mut task: ConnTask) {
        self.shared.metrics.pool_submission_rejected();
        self.shared
            .log
            .admission_rejected(&task.peer.to_string(), "pool saturated");

        let _ = response::write_bytes(
            &mut task.stream,
            SHED_503,
            self.shared.conn.socket_write_timeout,
        )
        .await;
    }
}
