// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and the retry decision applied on step failure.

use crate::error::{EngineError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Per-step retry policy with exponential backoff.
///
/// Delay before attempt `n + 1` is
/// `min(initial_delay * multiplier^(n - 1), max_delay)` where `n` is the
/// attempt that just failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Error kinds eligible for retry. Empty means any retryable kind.
    #[serde(default)]
    pub retry_on: HashSet<ErrorKind>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            multiplier,
            max_delay_ms: max_delay.as_millis() as u64,
            retry_on: HashSet::new(),
        }
    }

    /// Restricts retries to the given error kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff delay after the given 1-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent as i32);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether the policy covers this error kind.
    pub fn covers(&self, kind: ErrorKind) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(&kind)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            retry_on: HashSet::new(),
        }
    }
}

/// Outcome of evaluating a step failure against its retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-attempt after sleeping for the delay.
    Retry { delay: Duration },
    /// Exhausted or ineligible; promote to a terminal step failure.
    Propagate,
}

/// Decides whether a just-failed attempt is retried.
///
/// `attempts` counts completed attempts including the failing one.
pub fn evaluate(
    policy: Option<&RetryPolicy>,
    attempts: u32,
    error: &EngineError,
) -> RetryDecision {
    let policy = match policy {
        Some(policy) => policy,
        None => return RetryDecision::Propagate,
    };
    if !error.is_retryable() || !policy.covers(error.kind()) || attempts >= policy.max_attempts {
        return RetryDecision::Propagate;
    }
    RetryDecision::Retry {
        delay: policy.delay_for_attempt(attempts),
    }
}
