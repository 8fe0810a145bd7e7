//! Timeout utilities.
//!
//! Nothing in SwKit imposes a deadline by default; a configured timeout turns a
//! slow network into the same `Timeout` failure the strategies already fall
//! back on.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{Result, SwKitError};

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| {
            debug!(?timeout, "Operation timed out");
            SwKitError::Timeout(timeout)
        })
}

/// Run a fallible operation, bounded by `timeout` when one is configured.
pub async fn maybe_with_timeout<T, Fut>(timeout: Option<Duration>, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => with_timeout(limit, || operation).await?,
        None => operation.await,
    }
}
