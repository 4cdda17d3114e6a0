use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PeopleError;

/// Bounded retry with linear backoff for independent units of work.
///
/// Only transient storage errors are retried; every other error is returned
/// immediately. A unit of work must be safe to run again from the start,
/// which is why the merge operator never runs under a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Sleep before attempt `n + 1` is `backoff_ms * n`.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Run `work`, retrying transient failures. `what` names the unit of
    /// work in logs.
    pub fn run<T>(
        &self,
        what: &str,
        mut work: impl FnMut() -> Result<T, PeopleError>,
    ) -> Result<T, PeopleError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match work() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = Duration::from_millis(self.backoff_ms * attempt as u64);
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "people: {what} failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
