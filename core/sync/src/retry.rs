//! Retry policies for the service calls of a sync cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use switchyard_common::Result;

/// Service call made during a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Declare,
    FetchSettings,
    FetchRules,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Request::Declare => "declare",
            Request::FetchSettings => "settings fetch",
            Request::FetchRules => "rules fetch",
        })
    }
}

/// Backoff schedule of one request kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Retries after the first call.
    pub retries: u32,
    /// Pause before the first retry. Doubles for every further retry.
    pub base: Duration,
    pub ceiling: Duration,
    /// Draw each pause from the upper half of its slot.
    pub jitter: bool,
}

impl Backoff {
    pub fn new(retries: u32, base: Duration) -> Self {
        Self {
            retries,
            base,
            ceiling: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Pause before retry number `retry`, counting from 1.
    pub fn pause(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let slot = self.base.saturating_mul(factor).min(self.ceiling);
        if self.jitter && !slot.is_zero() {
            slot.mul_f64(0.5 + rand::random::<f64>() * 0.5)
        } else {
            slot
        }
    }
}

/// Backoff per request kind, with a shared fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    fallback: Backoff,
    overrides: BTreeMap<Request, Backoff>,
}

impl RetryPolicy {
    pub fn new(fallback: Backoff) -> Self {
        Self {
            fallback,
            overrides: BTreeMap::new(),
        }
    }

    /// Use `backoff` for `request` instead of the fallback.
    pub fn with(mut self, request: Request, backoff: Backoff) -> Self {
        self.overrides.insert(request, backoff);
        self
    }

    pub fn backoff(&self, request: Request) -> &Backoff {
        self.overrides.get(&request).unwrap_or(&self.fallback)
    }

    /// Make a service call, repeating it while it fails with a transient
    /// error and the request still has retries left.
    ///
    /// Every retry made is added to `retries`.
    ///
    /// # Errors
    /// - The first permanent error, or the last transient one
    pub async fn run<T, F, Fut>(&self, request: Request, retries: &mut usize, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = self.backoff(request);
        let mut retry = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("{} succeeded on retry {}", request, retry);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            if !err.is_transient() || retry >= backoff.retries {
                if retry > 0 {
                    warn!("Giving up {} after {} retries: {}", request, retry, err);
                }
                return Err(err);
            }

            retry += 1;
            *retries += 1;
            let pause = backoff.pause(retry);
            warn!(
                "{} failed: {}. Retry {}/{} in {:?}",
                request, err, retry, backoff.retries, pause
            );
            sleep(pause).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Backoff::new(2, Duration::from_millis(200)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use switchyard_common::Error;

    fn flaky(calls: &AtomicU32, failures: u32) -> impl Future<Output = Result<&'static str>> + '_ {
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(Error::Transport("connection reset".to_string()))
            } else {
                Ok("rules")
            }
        }
    }

    #[test]
    fn test_pause_doubles_up_to_ceiling() {
        let backoff = Backoff::new(5, Duration::from_millis(100))
            .with_ceiling(Duration::from_millis(300))
            .without_jitter();
        assert_eq!(backoff.pause(1), Duration::from_millis(100));
        assert_eq!(backoff.pause(2), Duration::from_millis(200));
        assert_eq!(backoff.pause(3), Duration::from_millis(300));
        assert_eq!(backoff.pause(40), Duration::from_millis(300));
        assert_eq!(Backoff::none().pause(1), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let backoff = Backoff::new(3, Duration::from_millis(400));
        for _ in 0..50 {
            let pause = backoff.pause(1);
            assert!(pause >= Duration::from_millis(200));
            assert!(pause <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_overrides_apply_per_request() {
        let policy = RetryPolicy::new(Backoff::new(2, Duration::from_millis(10)))
            .with(Request::FetchRules, Backoff::none());
        assert_eq!(policy.backoff(Request::FetchRules).retries, 0);
        assert_eq!(policy.backoff(Request::Declare).retries, 2);
        assert_eq!(policy.backoff(Request::FetchSettings).retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let mut retries = 0;

        let result = policy
            .run(Request::FetchRules, &mut retries, || flaky(&calls, 2))
            .await;
        assert_eq!(result.unwrap(), "rules");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_run_out() {
        let policy = RetryPolicy::default().with(Request::Declare, Backoff::new(1, Duration::from_millis(5)));
        let calls = AtomicU32::new(0);
        let mut retries = 0;

        let result = policy.run(Request::Declare, &mut retries, || flaky(&calls, 5)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let mut retries = 0;

        let result: Result<()> = policy
            .run(Request::Declare, &mut retries, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidInput("version 'x' is not major.minor".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }
}
