use std::future::Future;
use std::time::Duration;

use rand::Rng;

use drummond_core::DrummondError;

/// Bounded retry with exponential backoff and jitter. Only retriable errors
/// (Unavailable, Timeout) are retried; everything else surfaces at once.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, DrummondError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DrummondError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt + 1 < max_attempts => {
                let backoff = base_delay * 2u32.saturating_pow(attempt);
                let jitter_ms = rand::thread_rng()
                    .gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
                let delay = backoff + Duration::from_millis(jitter_ms);
                tracing::debug!(attempt, ?delay, error = %e, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn transient_errors_retry_to_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_backoff(5, Duration::from_millis(1), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DrummondError::Unavailable("503".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = retry_with_backoff(5, Duration::from_millis(1), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DrummondError::InvalidInput("bad payload".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, _> = retry_with_backoff(3, Duration::from_millis(1), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DrummondError::Unavailable("down".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
