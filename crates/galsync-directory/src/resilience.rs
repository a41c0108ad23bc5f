//! Single retry on server down
//!
//! Every pool-backed operation runs through [`execute_with_one_retry`]: the
//! first attempt uses a checked-out connection, and a server-down failure is
//! retried exactly once through the pool's own acquisition path.

use std::future::Future;
use tracing::warn;

use crate::error::DirectoryResult;

/// Which attempt an operation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Use a checked-out, possibly idle, connection.
    Checkout,
    /// The checked-out connection went down; acquire a fresh one.
    Retry,
}

/// Run `operation`, retrying once on a server-down error.
pub async fn execute_with_one_retry<F, Fut, T>(
    operation_name: &str,
    mut operation: F,
) -> DirectoryResult<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = DirectoryResult<T>>,
{
    match operation(Attempt::Checkout).await {
        Err(e) if e.is_server_down() => {
            warn!(
                operation = operation_name,
                error = %e,
                "server down, retrying once on a fresh connection"
            );
            operation(Attempt::Retry).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_runs_once() {
        let calls = AtomicU32::new(0);
        let result = execute_with_one_retry("search", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                assert_eq!(attempt, Attempt::Checkout);
                Ok::<_, DirectoryError>(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_down_retries_once_on_fresh_connection() {
        let calls = AtomicU32::new(0);
        let result = execute_with_one_retry("modify", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    Attempt::Checkout => Err(DirectoryError::server_down("reset by peer")),
                    Attempt::Retry => Ok("done"),
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_server_down_propagates() {
        let calls = AtomicU32::new(0);
        let result: DirectoryResult<()> = execute_with_one_retry("delete", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DirectoryError::server_down("still down")) }
        })
        .await;
        assert!(result.unwrap_err().is_server_down());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DirectoryResult<()> = execute_with_one_retry("compare", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(DirectoryError::ObjectNotFound {
                    identifier: "uid=x".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(DirectoryError::ObjectNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
