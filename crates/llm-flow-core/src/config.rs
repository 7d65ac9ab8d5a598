// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable engine parameters, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum scheduler turns and async workers running at once.
    pub worker_permits: usize,
    /// Bounded wait for the per-instance lock before yielding `BUSY`.
    pub lock_wait_ms: u64,
    /// Retry policy applied to steps that declare none. `None` means such
    /// steps fail on first error.
    pub default_retry: Option<RetryPolicy>,
    /// Interval between background retention sweeps.
    pub sweep_interval_secs: u64,
    /// Age after which terminal async task state is swept.
    pub async_state_retention_hours: u32,
    /// Age after which suspensions are swept. Off by default: suspensions
    /// are durable indefinitely unless the host opts in.
    pub suspension_retention_hours: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_permits: 8,
            lock_wait_ms: 5_000,
            default_retry: None,
            sweep_interval_secs: 3_600,
            async_state_retention_hours: 24,
            suspension_retention_hours: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_permits(mut self, permits: usize) -> Self {
        self.worker_permits = permits.max(1);
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_async_state_retention_hours(mut self, hours: u32) -> Self {
        self.async_state_retention_hours = hours;
        self
    }

    pub fn with_suspension_retention_hours(mut self, hours: u32) -> Self {
        self.suspension_retention_hours = Some(hours);
        self
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Parses a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
