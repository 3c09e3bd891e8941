//! Per-client-IP sliding-window rate limiting.
//!
//! One process-wide instance behind a single mutex. The lock is held only
//! for the duration of an admission check and never across I/O. A sharded
//! variant (lock striped by IP hash) is a drop-in upgrade behind the same
//! interface.

use crate::limits::RateLimits;
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateDenial {
    /// The client is inside a hard block. Carries the remaining seconds.
    Blocked(u64),
    /// The main window was exhausted just now; a hard block starts.
    WindowExceeded(u64),
    /// The burst window is full. Denied without extending any block.
    BurstExceeded(u64),
}

impl RateDenial {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            RateDenial::Blocked(_) => "temporarily blocked",
            RateDenial::WindowExceeded(_) => "rate limit exceeded",
            RateDenial::BurstExceeded(_) => "burst exceeded",
        }
    }

    /// Seconds the client should wait before retrying.
    pub(crate) fn retry_after(self) -> u64 {
        match self {
            RateDenial::Blocked(secs)
            | RateDenial::WindowExceeded(secs)
            | RateDenial::BurstExceeded(secs) => secs,
        }
    }

    /// A fresh block is attack-shaped; single burst denials are not.
    pub(crate) fn is_block(self) -> bool {
        matches!(self, RateDenial::WindowExceeded(_))
    }
}

#[derive(Debug, Default)]
struct ClientRecord {
    window: VecDeque<Instant>,
    burst: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window admission per client IP.
///
/// Memory per IP is bounded by `requests_per_window + burst_requests`
/// timestamps: entries are pruned on access, and nothing is appended on a
/// denial.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limits: RateLimits,
    state: Mutex<HashMap<IpAddr, ClientRecord>>,
}

impl RateLimiter {
    pub(crate) fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check for one request from `ip` at `now`.
    ///
    /// Once a client is blocked at time T, no request is allowed before
    /// `T + block_seconds` regardless of interleaving.
    pub(crate) fn is_allowed(&self, ip: IpAddr, now: Instant) -> Result<(), RateDenial> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = state.entry(ip).or_default();

        if let Some(until) = record.blocked_until {
            if now < until {
                return Err(RateDenial::Blocked(secs_ceil(until - now)));
            }
            record.blocked_until = None;
        }

        prune(&mut record.window, now, Duration::from_secs(self.limits.window_seconds));
        prune(&mut record.burst, now, Duration::from_secs(self.limits.burst_seconds));

        if record.window.len() >= self.limits.requests_per_window {
            record.blocked_until = Some(now + Duration::from_secs(self.limits.block_seconds));
            return Err(RateDenial::WindowExceeded(self.limits.block_seconds));
        }
        if record.burst.len() >= self.limits.burst_requests {
            return Err(RateDenial::BurstExceeded(self.limits.burst_seconds));
        }

        record.window.push_back(now);
        record.burst.push_back(now);
        Ok(())
    }

    /// Drops clients whose windows and blocks have fully expired.
    /// Called opportunistically; correctness does not depend on it.
    #[allow(dead_code)]
    pub(crate) fn cleanup(&self, now: Instant) {
        let window = Duration::from_secs(self.limits.window_seconds);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.retain(|_, record| {
            let blocked = record.blocked_until.is_some_and(|until| now < until);
            blocked
                || record
                    .window
                    .back()
                    .is_some_and(|last| now.duration_since(*last) <= window)
        });
    }
}

fn prune(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = deque.front() {
        if now.duration_since(*front) > window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

fn secs_ceil(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    match duration.subsec_nanos() {
        0 => secs.max(1),
        _ => secs + 1,
    }
}
