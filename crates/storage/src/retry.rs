#![forbid(unsafe_code)]

use crate::StoreError;
use rusqlite::ErrorCode;
use std::time::Duration;

/// Bounded busy-retry applied to every queue mutation. The connection's
/// busy_timeout already absorbs short contention; this loop covers the
/// locked-database errors that surface anyway under many writer processes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            sleep: Duration::from_millis(800),
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::DatabaseBusy
                || failure.code == ErrorCode::DatabaseLocked
    )
}

pub(crate) fn with_busy_retry<T>(
    policy: RetryPolicy,
    op: &'static str,
    mut f: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(StoreError::Sql(err)) if is_busy(&err) => {
                eprintln!("[LOCK] retry {attempt}/{attempts} on {op}");
                if attempt < attempts {
                    std::thread::sleep(policy.sleep);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::ContentionExceeded { op, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            sleep: Duration::from_millis(1),
        }
    }

    fn busy_error() -> StoreError {
        StoreError::Sql(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let result = with_busy_retry(quick_policy(5), "test", || {
            calls += 1;
            Ok::<_, StoreError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_busy_until_bound_then_fails() {
        let mut calls = 0u32;
        let err = with_busy_retry(quick_policy(4), "test", || {
            calls += 1;
            Err::<(), _>(busy_error())
        })
        .unwrap_err();
        assert_eq!(calls, 4, "must attempt exactly the configured bound");
        match err {
            StoreError::ContentionExceeded { op, attempts } => {
                assert_eq!(op, "test");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected ContentionExceeded, got {other:?}"),
        }
    }

    #[test]
    fn non_busy_errors_are_not_retried() {
        let mut calls = 0;
        let err = with_busy_retry(quick_policy(5), "test", || {
            calls += 1;
            Err::<(), _>(StoreError::UnknownId(7))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, StoreError::UnknownId(7)));
    }

    #[test]
    fn busy_then_success_recovers() {
        let mut calls = 0;
        let result = with_busy_retry(quick_policy(5), "test", || {
            calls += 1;
            if calls < 3 {
                Err(busy_error())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
