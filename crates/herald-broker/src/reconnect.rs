//! ---
//! herald_section: "02-broker-connectivity"
//! herald_subsection: "module"
//! herald_type: "source"
//! herald_scope: "code"
//! herald_description: "Broker connection primitives and pub/sub transports."
//! herald_version: "v0.0.0-prealpha"
//! herald_owner: "tbd"
//! ---
use std::time::Duration;

use crate::connection::ReconnectGate;

/// Capped linear backoff governing automatic reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay added per attempt index.
    pub step: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
    /// Hard cap on the total time spent retrying.
    pub max_total: Duration,
    /// Maximum number of attempts before giving up, if bounded.
    pub max_attempts: Option<u32>,
}

/// Verdict for the next reconnect step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Sleep for the delay, then try again.
    RetryAfter(Duration),
    /// Stop reconnecting; the reason is meant for logs.
    Abandon(&'static str),
}

impl ReconnectPolicy {
    /// Policy with the default backoff shape and an attempt bound.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed):
    /// `min(attempt * step, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }

    /// Decide what happens after `attempt` failed, `elapsed` into the episode.
    pub fn next(&self, attempt: u32, elapsed: Duration, gate: &dyn ReconnectGate) -> ReconnectDecision {
        if !gate.allow_reconnect() {
            return ReconnectDecision::Abandon("circuit breaker is open");
        }
        if elapsed >= self.max_total {
            return ReconnectDecision::Abandon("retry time exhausted");
        }
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return ReconnectDecision::Abandon("reconnect attempts exhausted");
            }
        }
        let delay = self.delay_for(attempt);
        if elapsed + delay > self.max_total {
            return ReconnectDecision::Abandon("retry time exhausted");
        }
        ReconnectDecision::RetryAfter(delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
            max_total: Duration::from_secs(60 * 60),
            max_attempts: None,
        }
    }
}
