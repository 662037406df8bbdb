//! Process-wide request gate: minimum spacing plus shared throttling backoff.
//!
//! Every upstream request from every agent passes through one [`RequestGate`].
//! The wait-until computation and the "request sent" update happen under the
//! same lock, and the lock is held while waiting, so callers are admitted in
//! arrival order and never closer together than the configured spacing.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Spacing and backoff parameters of the gate.
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy {
    /// Minimum time between two admitted requests
    pub spacing: Duration,

    /// First throttling delay; doubles on every consecutive throttle
    pub backoff_base: Duration,

    /// Upper bound for a single backoff delay
    pub backoff_cap: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            spacing: Duration::from_millis(200),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl GatePolicy {
    /// A fresh doubling schedule starting at `backoff_base`.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.backoff_base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.backoff_cap)
            .with_max_elapsed_time(None)
            .build()
    }
}

struct GateState {
    last_request: Option<Instant>,
    not_before: Option<Instant>,
    backoff: ExponentialBackoff,
    consecutive_throttles: u32,
}

/// Serializes upstream requests across all callers.
pub struct RequestGate {
    policy: GatePolicy,
    state: Mutex<GateState>,
}

impl RequestGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(GateState {
                last_request: None,
                not_before: None,
                backoff: policy.backoff(),
                consecutive_throttles: 0,
            }),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Wait for a send slot and record it as used.
    ///
    /// Dropping the returned future before it completes leaves the gate
    /// untouched.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let mut ready = now;
        if let Some(last) = state.last_request {
            ready = ready.max(last + self.policy.spacing);
        }
        if let Some(not_before) = state.not_before {
            ready = ready.max(not_before);
        }

        if ready > now {
            debug!(wait_ms = (ready - now).as_millis() as u64, "Waiting for request slot");
            tokio::time::sleep_until(ready).await;
        }

        state.last_request = Some(Instant::now());
    }

    /// Record a throttling signal; every caller waits out the returned delay.
    pub async fn on_throttled(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock().await;

        let scheduled = state
            .backoff
            .next_backoff()
            .unwrap_or(self.policy.backoff_cap);
        let delay = match retry_after {
            Some(hint) => scheduled.max(hint),
            None => scheduled,
        };

        let until = Instant::now() + delay;
        state.not_before = Some(state.not_before.map_or(until, |nb| nb.max(until)));
        state.consecutive_throttles += 1;

        warn!(
            delay_ms = delay.as_millis() as u64,
            consecutive = state.consecutive_throttles,
            "Upstream throttled, backing off"
        );

        delay
    }

    /// A request went through; drop back to the base backoff.
    pub async fn on_success(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_throttles > 0 {
            debug!("Upstream recovered, resetting backoff");
        }
        state.backoff.reset();
        state.consecutive_throttles = 0;
    }
}
