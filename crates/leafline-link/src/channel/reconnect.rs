//! Reconnection policy and exponential backoff scheduling.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::NetworkObserver;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Growth factor applied per attempt. Must be greater than 1.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Maximum number of retries (None = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl ReconnectPolicy {
    /// 1s base, x1.5 per attempt, capped at 30s, 10 attempts.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }

    /// Plain doubling from 1s, capped at 30s, 5 attempts.
    #[must_use]
    pub const fn legacy_doubling() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(5),
        }
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    ///
    /// `min(base * multiplier^attempt, max)`.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Whether `attempt` retries have already used up the budget.
    #[must_use]
    pub const fn has_exceeded_max(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt >= max,
            None => false,
        }
    }
}

/// What the channel should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Retry after `delay`; `attempt` is the one-based retry number.
    Retry {
        /// One-based retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The network is known to be down; park until it returns.
    WaitForNetwork,
    /// The budget is spent.
    Exceeded {
        /// Retries made before giving up.
        attempts: u32,
    },
}

/// Tracks retry attempts for one channel.
#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    attempt: u32,
    network: Option<Arc<NetworkObserver>>,
}

impl ReconnectScheduler {
    /// Create a scheduler with no network awareness.
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            network: None,
        }
    }

    /// Consult `network` before issuing delays.
    #[must_use]
    pub fn with_network(mut self, network: Arc<NetworkObserver>) -> Self {
        self.network = Some(network);
        self
    }

    /// The policy in use.
    #[must_use]
    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Retries issued since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and decide what happens next.
    ///
    /// While the network observer reports no connectivity this returns
    /// [`ScheduleDecision::WaitForNetwork`] without touching the attempt
    /// counter.
    pub fn on_failure(&mut self) -> ScheduleDecision {
        if self.network_down() {
            return ScheduleDecision::WaitForNetwork;
        }

        if self.policy.has_exceeded_max(self.attempt) {
            return ScheduleDecision::Exceeded {
                attempts: self.attempt,
            };
        }

        let delay = self.policy.next_delay(self.attempt);
        self.attempt += 1;
        ScheduleDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn network_down(&self) -> bool {
        self.network
            .as_ref()
            .is_some_and(|network| !network.current().is_connected)
    }
}
