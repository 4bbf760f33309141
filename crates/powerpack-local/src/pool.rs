//! Bounded fan-out and fixed-schedule retry for rate-limited vendor APIs.

use futures_util::stream::{self, StreamExt};
use powerpack_core::{Error, Result};
use std::future::Future;
use std::time::Duration;

pub const SEARCH_CONCURRENCY: usize = 10;
pub const SCRAPE_CONCURRENCY: usize = 10;
pub const REDDIT_CONCURRENCY: usize = 10;
pub const LLM_CONCURRENCY: usize = 3;

/// Upper bound on how long a server-provided Retry-After may stall one call.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Run `f` over `items` with at most `limit` futures in flight. Output order matches input
/// order regardless of completion order.
pub async fn bounded_map<I, T, F, Fut, O>(items: I, limit: usize, f: F) -> Vec<O>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = O>,
{
    // Materialize the (lazy) futures first so the closure type doesn't appear in the stream
    // type; avoids rustc's "FnOnce is not general enough" error in Send-checked callers.
    let futs: Vec<Fut> = items.into_iter().map(f).collect();
    stream::iter(futs)
        .buffered(limit.max(1))
        .collect()
        .await
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before retry #1, #2, ... The number of entries is the retry count.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
                Duration::from_millis(8_000),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    fn delay_for(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let scheduled = self.delays[attempt];
        match retry_after {
            Some(ra) => scheduled.max(ra.min(MAX_RETRY_AFTER)),
            None => scheduled,
        }
    }
}

/// Call `op` until it succeeds, fails with a non-retryable error, or the schedule runs out.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(policy, label, Error::is_retryable, op).await
}

/// Like [`with_retry`], but only errors accepted by `should_retry` are retried.
pub async fn with_retry_if<F, Fut, T, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if should_retry(&e) && attempt < policy.delays.len() => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::warn!(
                    target: "powerpack::retry",
                    call = label,
                    attempt = attempt + 1,
                    max = policy.delays.len(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn bounded_map_preserves_order_and_caps_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let out = bounded_map(0..12u64, 3, |i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(cur, Ordering::SeqCst);
                // Later items finish first to prove output order is input order.
                tokio::time::sleep(Duration::from_millis(20 - i)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 10
            }
        })
        .await;
        assert_eq!(out, (0..12u64).map(|i| i * 10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn zero_limit_is_treated_as_one() {
        let out = bounded_map(vec![1, 2], 0, |x| async move { x + 1 }).await;
        assert_eq!(out, vec![2, 3]);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(vec![Duration::ZERO; 3]);
        let r = with_retry(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::RateLimited {
                        message: "429".into(),
                        retry_after_ms: None,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(r, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_schedule_is_exhausted() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(vec![Duration::ZERO; 2]);
        let r: Result<()> = with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Network("reset".into())) }
        })
        .await;
        assert!(matches!(r, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let r: Result<()> = with_retry(&RetryPolicy::default(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(r, Err(Error::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_is_capped_at_thirty_seconds() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(vec![Duration::from_millis(10)]);
        let t0 = tokio::time::Instant::now();
        let r: Result<()> = with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::RateLimited {
                    message: "429".into(),
                    retry_after_ms: Some(600_000),
                })
            }
        })
        .await;
        assert!(matches!(r, Err(Error::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited = t0.elapsed();
        assert!(waited >= MAX_RETRY_AFTER && waited < MAX_RETRY_AFTER + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn predicate_limits_what_is_retried() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(vec![Duration::ZERO; 3]);
        let r: Result<()> = with_retry_if(
            &policy,
            "test",
            |e| matches!(e, Error::RateLimited { .. }),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Timeout("slow".into())) }
            },
        )
        .await;
        assert!(matches!(r, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_after_extends_but_is_capped() {
        let p = RetryPolicy::new(vec![Duration::from_millis(100)]);
        assert_eq!(
            p.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(p.delay_for(0, Some(Duration::from_secs(600))), MAX_RETRY_AFTER);
        assert_eq!(p.delay_for(0, None), Duration::from_millis(100));
    }
}
