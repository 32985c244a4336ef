//! Retrying commit wrapper for store writes.
//!
//! The connection to Postgres may drop transiently. Every write goes
//! through [`with_commit_retry`], which re-runs the whole operation (each
//! run opens its own transaction) a bounded number of times: first a few
//! immediate retries, then a few more after a short sleep, and finally
//! surfaces [`StoreError::Durability`].

use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;

/// Retry budget for store writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRetryConfig {
    /// Retries issued straight after a transient failure.
    pub immediate_retries: u32,
    /// Retries issued after sleeping `backoff`.
    pub backoff_retries: u32,
    /// Sleep before each backoff retry.
    pub backoff: Duration,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            immediate_retries: 2,
            backoff_retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

impl CommitRetryConfig {
    /// Total number of runs the wrapper may make.
    pub fn max_runs(&self) -> u32 {
        1 + self.immediate_retries + self.backoff_retries
    }
}

/// Run `op` until it succeeds, fails non-transiently, or the retry budget
/// in `config` is spent.
///
/// Non-transient errors (constraint violations, bad SQL, missing rows) are
/// returned as [`StoreError::Database`] on the first occurrence.
pub async fn with_commit_retry<T, F, Fut>(
    config: &CommitRetryConfig,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let max_runs = config.max_runs();
    let mut run = 0u32;

    loop {
        run += 1;
        match op().await {
            Ok(value) => {
                if run > 1 {
                    tracing::info!(operation, attempts = run, "Store write succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_transient(&e) => {
                if run >= max_runs {
                    tracing::error!(
                        operation,
                        attempts = run,
                        error = %e,
                        "Store write failed, retry budget exhausted",
                    );
                    return Err(StoreError::Durability {
                        operation,
                        attempts: run,
                        message: e.to_string(),
                    });
                }

                let immediate = run <= config.immediate_retries;
                tracing::warn!(
                    operation,
                    attempt = run,
                    immediate,
                    error = %e,
                    "Transient store error, retrying",
                );
                if !immediate {
                    tokio::time::sleep(config.backoff).await;
                }
            }
            Err(e) => return Err(StoreError::Database(e)),
        }
    }
}

/// Whether a sqlx error is worth retrying.
///
/// Covers dropped connections, pool exhaustion, and the Postgres SQLSTATEs
/// for connection exceptions (class `08`), serialization failures,
/// deadlocks, and server shutdown.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code.starts_with("08")
                || matches!(code.as_ref(), "40001" | "40P01" | "57P01" | "57P02" | "57P03")
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    }

    fn fast_config() -> CommitRetryConfig {
        CommitRetryConfig {
            immediate_retries: 2,
            backoff_retries: 1,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(is_transient(&io_error()));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::PoolClosed));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_commit_retry(&fast_config(), "test_op", || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(io_error())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_durability_error_when_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = fast_config();
        let result: Result<(), _> = with_commit_retry(&config, "test_op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::PoolTimedOut)
        })
        .await;

        assert_matches!(
            result,
            Err(StoreError::Durability { operation: "test_op", attempts: 4, .. })
        );
        assert_eq!(calls.load(Ordering::SeqCst), config.max_runs());
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_commit_retry(&fast_config(), "test_op", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
        .await;

        assert_matches!(result, Err(StoreError::Database(sqlx::Error::RowNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
