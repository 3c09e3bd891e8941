//! Bounded worker pool: a fixed set of long-lived worker tasks consuming
//! connections from a bounded FIFO.
//!
//! Submission never waits. `try_submit` succeeds iff the queue has room,
//! so the accept loop can shed load at the edge instead of queueing
//! unboundedly. Workers poll with the configured wait strategy and notice
//! the shutdown signal on their next empty poll; they exit only once the
//! signal is set AND the queue is drained.

use crate::{
    limits::{ServerLimits, WaitStrategy},
    server::connection::{self, Shared},
};
use crossbeam::queue::ArrayQueue;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle, time::timeout};
use tracing::error;

/// One accepted connection awaiting a worker.
#[derive(Debug)]
pub(crate) struct ConnTask {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolCounters {
    pub(crate) completed: u64,
    pub(crate) failed: u64,
}

pub(crate) struct WorkerPool {
    queue: Arc<ArrayQueue<ConnTask>>,
    handles: Vec<JoinHandle<()>>,
    counters: Arc<Mutex<PoolCounters>>,
}

impl WorkerPool {
    /// Spawns `limits.workers` workers over a queue of
    /// `limits.queue_capacity` slots.
    pub(crate) fn start(
        limits: &ServerLimits,
        shared: Arc<Shared>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queue = Arc::new(ArrayQueue::new(limits.queue_capacity));
        let counters = Arc::new(Mutex::new(PoolCounters::default()));
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..limits.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    queue.clone(),
                    shared.clone(),
                    shutdown.clone(),
                    limits.wait_strategy.clone(),
                    counters.clone(),
                    active.clone(),
                ))
            })
            .collect();

        Self {
            queue,
            handles,
            counters,
        }
    }

    /// Immediate submission: `Err` returns the task when the queue is full.
    pub(crate) fn try_submit(&self, task: ConnTask) -> Result<(), ConnTask> {
        self.queue.push(task)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn counters(&self) -> PoolCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for each worker with a 5 s ceiling, then abandons stragglers.
    /// The shutdown signal must already be set through the server's watch
    /// channel.
    pub(crate) async fn join(&mut self, wait: bool) {
        if !wait {
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<ArrayQueue<ConnTask>>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    wait: WaitStrategy,
    counters: Arc<Mutex<PoolCounters>>,
    active: Arc<AtomicUsize>,
) {
    loop {
        match queue.pop() {
            Some(task) => {
                let conn_shared = shared.clone();
                shared
                    .metrics
                    .pool_active_workers(active.fetch_add(1, Ordering::Relaxed) + 1);

                // The connection runs in its own task so a panic is
                // contained by the join instead of killing the worker.
                let joined = tokio::spawn(async move {
                    connection::serve(&conn_shared, task.stream, task.peer).await;
                })
                .await;

                shared
                    .metrics
                    .pool_active_workers(active.fetch_sub(1, Ordering::Relaxed) - 1);

                let mut counters = counters.lock().unwrap_or_else(|e| e.into_inner());
                match joined {
                    Ok(()) => counters.completed += 1,
                    Err(e) => {
                        counters.failed += 1;
                        error!(worker = id, error = %e, "connection task failed");
                    }
                }
            }
            None => {
                if *shutdown.borrow() {
                    break;
                }
                match &wait {
                    WaitStrategy::Yield => tokio::task::yield_now().await,
                    WaitStrategy::Sleep(time) => tokio::time::sleep(*time).await,
                }
            }
        }
    }
}
