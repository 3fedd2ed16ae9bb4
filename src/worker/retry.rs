use std::thread;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::is_busy_error;

const DEFAULT_BUSY_DELAYS: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(250),
];

/// Bounded retry schedule for statements that fail with `SQLITE_BUSY`/`SQLITE_LOCKED`.
///
/// The engine's own busy timeout runs first; these delays are extra attempts on top of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyRetryPolicy {
    delays: Vec<Duration>,
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self {
            delays: DEFAULT_BUSY_DELAYS.to_vec(),
        }
    }
}

impl BusyRetryPolicy {
    #[must_use]
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Fail on the first busy error.
    #[must_use]
    pub fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Total attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Run `op` on the current thread, sleeping between busy failures.
    ///
    /// Returns the final result together with the number of attempts made.
    pub(crate) fn run_blocking<T>(
        &self,
        mut op: impl FnMut() -> Result<T, rusqlite::Error>,
    ) -> (Result<T, rusqlite::Error>, usize) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = op();
            match &result {
                Err(err) if is_busy_error(err) => {
                    if let Some(delay) = self.delays.get(attempts - 1).copied() {
                        trace!(attempt = attempts, ?delay, "database busy, retrying");
                        thread::sleep(delay);
                        continue;
                    }
                    warn!(attempts, "database still busy after retries");
                    return (result, attempts);
                }
                _ => return (result, attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            None,
        )
    }

    #[test]
    fn retries_until_success() {
        let policy = BusyRetryPolicy::new(vec![Duration::ZERO; 3]);
        let mut calls = 0;
        let (result, attempts) = policy.run_blocking(|| {
            calls += 1;
            if calls < 3 { Err(busy()) } else { Ok(calls) }
        });
        assert_eq!(result.expect("succeeds"), 3);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn gives_up_after_schedule() {
        let policy = BusyRetryPolicy::new(vec![Duration::ZERO; 2]);
        let (result, attempts) = policy.run_blocking(|| Err::<(), _>(busy()));
        assert!(result.is_err());
        assert_eq!(attempts, policy.max_attempts());
    }

    #[test]
    fn other_errors_are_not_retried() {
        let policy = BusyRetryPolicy::default();
        let (result, attempts) =
            policy.run_blocking(|| Err::<(), _>(rusqlite::Error::InvalidQuery));
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
