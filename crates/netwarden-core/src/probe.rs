//! Connectivity probing.
//!
//! [`wait_until_reachable`] is the only polling primitive in the engine; both
//! the post-rotation wait and the post-reset wait go through it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::command::{succeeded, CommandRunner};

/// Well-known host used for reachability checks.
pub const PROBE_HOST: &str = "8.8.8.8";

/// Fixed cadence between reachability polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default window for connectivity to come back after a change.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(90);

/// A single bounded-latency reachability check.
pub trait Reachability: Send + Sync {
    fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// ICMP echo via the system `ping`: 3 attempts, 2s each, success if any reply.
pub struct PingProbe<R> {
    runner: Arc<R>,
    host: String,
}

impl<R: CommandRunner> PingProbe<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self::with_host(runner, PROBE_HOST)
    }

    pub fn with_host(runner: Arc<R>, host: impl Into<String>) -> Self {
        Self {
            runner,
            host: host.into(),
        }
    }
}

impl<R: CommandRunner> Reachability for PingProbe<R> {
    async fn is_reachable(&self) -> bool {
        let ok = succeeded(&*self.runner, "ping", &["-c", "3", "-W", "2", &self.host]).await;
        tracing::debug!(host = %self.host, reachable = ok, "ping");
        ok
    }
}

/// Poll `probe` every [`POLL_INTERVAL`] until it succeeds or `timeout` elapses.
///
/// Returns as soon as the first successful check comes back, and never waits
/// past `timeout`.
pub async fn wait_until_reachable<P: Reachability + ?Sized>(probe: &P, timeout: Duration) -> bool {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut polls = 0u32;
    while Instant::now() < deadline {
        polls += 1;
        if probe.is_reachable().await {
            tracing::debug!(polls, waited_s = started.elapsed().as_secs(), "connectivity confirmed");
            return true;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(POLL_INTERVAL.min(left)).await;
    }
    tracing::debug!(polls, timeout_s = timeout.as_secs(), "connectivity wait timed out");
    false
}
