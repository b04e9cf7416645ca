use crate::RegistryError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for transient registry failures.
///
/// Only `RegistryError::Unavailable` is retried. Anything else, or the last
/// failure after `max_attempts`, is returned to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Growth factor between delays, in percent (200 doubles each time).
    pub backoff_multiplier_percent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
            backoff_multiplier_percent: 200,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays slept between consecutive attempts.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut next = self.initial_backoff_ms;
        for _ in 1..self.max_attempts.max(1) {
            delays.push(Duration::from_millis(next.min(self.max_backoff_ms)));
            next = next.saturating_mul(u64::from(self.backoff_multiplier_percent)) / 100;
        }
        delays
    }

    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let schedule = self.backoff_schedule();
        let attempts = schedule.len() + 1;
        let mut delays = schedule.into_iter();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    let Some(delay) = delays.next() else {
                        tracing::warn!("{label}: giving up after {attempts} attempt(s): {e}");
                        return Err(e);
                    };
                    tracing::warn!(
                        "{label}: attempt {attempt}/{attempts} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
