use std::future::Future;
use std::time::Duration;

/// Bounded retry with exponentially growing delays between attempts.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    max_retries: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        ExponentialBackoff {
            max_retries: max_retries.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay).filter(|d| !d.is_zero());
        self
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let raw = self.base_delay.saturating_mul(1u32 << shift);
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }

    /// Runs `op` until it succeeds or the retry budget is spent, returning
    /// the last error in the latter case.
    pub async fn perform<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    log::debug!("attempt {} failed: {}, retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delays_double_per_attempt() {
        let backoff = ExponentialBackoff::new(5, Duration::from_millis(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(8));

        let capped = backoff.with_max_delay(Duration::from_millis(3));
        assert_eq!(capped.delay_for_attempt(4), Duration::from_millis(3));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let backoff = ExponentialBackoff::new(5, Duration::from_millis(1));
        let result: Result<(), String> = backoff
            .perform(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unreachable".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn stops_on_first_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let backoff = ExponentialBackoff::new(5, Duration::from_millis(1));
        let result: Result<usize, String> = backoff
            .perform(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {}", n))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
