//! Fixed-delay retry around calls into external collaborators.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection failures and timeouts.
    Transport,
    /// The remote side is overloaded (HTTP 429 / 5xx).
    Throttled,
    /// The remote side refused the request outright.
    Rejected,
    /// Local file or database failures.
    Storage,
    /// Malformed payloads in either direction.
    Encoding,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub retriable_kinds: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(60),
            retriable_kinds: vec![ErrorKind::Transport, ErrorKind::Throttled],
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            retriable_kinds: Vec::new(),
        }
    }

    pub fn is_retriable<E: Classify>(&self, err: &E) -> bool {
        self.retriable_kinds.contains(&err.kind())
    }

    pub fn run<T, E>(&self, operation: &str, f: impl FnMut() -> Result<T, E>) -> Result<T, E>
    where
        E: Classify + Display,
    {
        self.run_with_sleep(operation, f, std::thread::sleep)
    }

    pub fn run_with_sleep<T, E>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, E>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, E>
    where
        E: Classify + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts || !self.is_retriable(&err) => {
                    return Err(err)
                }
                Err(err) => {
                    warn!(
                        component = "retry",
                        event = "retry.attempt_failed",
                        operation,
                        attempt,
                        max_attempts,
                        kind = ?err.kind(),
                        delay_ms = self.delay.as_millis() as u64,
                        error = %err
                    );
                    sleep(self.delay);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
