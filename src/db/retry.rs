//! Bounded retry with exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::STORE_RETRY_BASE_MS;
use crate::error::Result;

/// Run `f` up to `max_attempts` times, backing off 100ms, 200ms, 400ms, ...
/// between attempts. Only errors reported transient by `AppError::is_transient`
/// are retried.
pub async fn with_retry<F, Fut, T>(op: &str, max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && e.is_transient() => {
                let backoff_ms = STORE_RETRY_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(10));
                warn!(
                    op,
                    attempt,
                    max_attempts,
                    "Store operation failed: {e}. Retrying in {backoff_ms}ms"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
