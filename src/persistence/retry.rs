//! Bounded backoff for persistence-layer failures

use super::StoreResult;
use crate::core::config::PersistenceConfig;
use std::future::Future;
use tracing::warn;

/// Run a store operation, retrying backend failures with exponential backoff.
///
/// Conflicts and missing records are returned immediately; only errors the
/// backend reports as transient are retried.
pub async fn with_retry<T, F, Fut>(config: &PersistenceConfig, operation: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation,
                    attempt + 1,
                    config.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
