//! Bounded fixed-delay retry policy and per-artifact backoff state

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How many attempts an artifact gets and how long to wait between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    TransientFailure,
    PermanentFailure,
}

/// One row of an artifact's delivery history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub artifact: PathBuf,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abandon,
}

/// Backoff state owned by exactly one artifact's delivery campaign
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            not_before: None,
        }
    }

    /// Start the next attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.not_before = None;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Record a failed attempt made at `now`
    pub fn record_failure(&mut self, now: Instant) -> RetryDecision {
        if self.exhausted() {
            self.not_before = None;
            return RetryDecision::Abandon;
        }
        self.not_before = Some(now + self.policy.delay);
        RetryDecision::RetryAfter(self.policy.delay)
    }

    /// Whether another attempt may start at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        !self.exhausted() && self.not_before.map_or(true, |t| now >= t)
    }
}
