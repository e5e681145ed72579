//! Bounded waits on external conditions.
//!
//! Steps that wait on the cluster (a node heartbeat, a replication stream
//! catching up) poll a check until it reports ready. Every wait has an
//! explicit deadline and observes the task's cancellation token, so a
//! stuck condition surfaces as `ExternalTimeout` and an abort as
//! `Cancelled`, never as an indefinite hang.

use std::future::Future;
use std::time::Duration;

use conductor_core::{Error, Result, WaitConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Check if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Total budget, in milliseconds.
    #[must_use]
    pub fn budget_ms(&self) -> u64 {
        u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Poll `check` until it returns `true`.
///
/// Returns `ExternalTimeout` once `deadline` passes and `Cancelled` as soon
/// as `cancel` fires, including while sleeping between polls. Check errors
/// propagate unchanged.
pub async fn poll_until<F, Fut>(
    condition: &str,
    deadline: Deadline,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut polls = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("aborted while waiting for {condition}")));
        }

        polls += 1;
        if check().await? {
            debug!(condition, polls, "Condition reached");
            return Ok(());
        }

        if deadline.is_expired() {
            return Err(Error::external_timeout(condition, deadline.budget_ms()));
        }

        let nap = poll_interval.min(deadline.remaining());
        tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::cancelled(format!("aborted while waiting for {condition}")));
            }
            () = tokio::time::sleep(nap) => {}
        }
    }
}

/// [`poll_until`] with the deadline and interval taken from configuration.
pub async fn wait_for<F, Fut>(
    condition: &str,
    config: WaitConfig,
    cancel: &CancellationToken,
    check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll_until(condition, Deadline::after(config.timeout), config.poll_interval, cancel, check)
        .await
}
