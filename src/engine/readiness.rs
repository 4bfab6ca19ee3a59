//! Readiness polling for a freshly spawned engine.
//!
//! The first probe right after spawn is expected to fail, so a single
//! failure is never fatal. Subsequent probes run on a fixed interval until
//! one succeeds, the overall deadline passes, or cancellation is observed.
//!
//! Cancellation is cooperative. The loop only checks for it while waiting
//! for the next tick; an attempt already in flight is handed a cancelled
//! token so that it can unwind quickly, and the loop waits for it to do so.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::{HealthCheckError, PollError};
use crate::config::ReadinessSettings;

/// An external operation that says whether the engine accepts connections.
pub trait HealthCheck {
    /// Run one probe.
    ///
    /// `token` is cancelled when the attempt should wind down, either
    /// because the caller lost interest or the per-attempt timeout passed.
    /// Implementations should return promptly once it fires.
    fn check(
        &self,
        token: CancellationToken,
    ) -> impl Future<Output = Result<(), HealthCheckError>> + Send;
}

/// Bounded-retry poll loop around a [`HealthCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoller {
    interval: Duration,
    attempt_timeout: Duration,
    deadline: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, attempt_timeout: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            attempt_timeout,
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Poll until the check succeeds, the deadline passes, or `cancel` fires.
    ///
    /// On deadline expiry the most recent failure is returned, not the first.
    pub async fn poll<H>(&self, check: &H, cancel: &CancellationToken) -> Result<(), PollError>
    where
        H: HealthCheck + Sync,
    {
        let start = Instant::now();
        let deadline = start + self.deadline;

        let mut attempt = 1u32;
        if let Err(e) = self.attempt(check, cancel).await {
            log::debug!(
                target: "sqlbuild::readiness",
                "Initial readiness probe failed ({}), retrying every {:?}",
                e.failure,
                self.interval
            );
        } else {
            return Ok(());
        }

        let mut ticker = time::interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::debug!(
                        target: "sqlbuild::readiness",
                        "Readiness poll cancelled after {} attempts",
                        attempt
                    );
                    return Err(PollError::Cancelled);
                }

                _ = ticker.tick() => {
                    attempt += 1;
                    let last = match self.attempt(check, cancel).await {
                        Ok(()) => {
                            log::debug!(
                                target: "sqlbuild::readiness",
                                "Readiness probe succeeded on attempt {} after {:?}",
                                attempt,
                                start.elapsed()
                            );
                            return Ok(());
                        }
                        Err(e) => e,
                    };
                    if Instant::now() >= deadline {
                        log::debug!(
                            target: "sqlbuild::readiness",
                            "Readiness deadline of {:?} passed after {} attempts",
                            self.deadline,
                            attempt
                        );
                        return Err(PollError::Unhealthy(last));
                    }
                    log::debug!(
                        target: "sqlbuild::readiness",
                        "Readiness probe attempt {} failed: {}",
                        attempt,
                        last.failure
                    );
                }
            }
        }
    }

    /// Run one attempt, expediting it once the per-attempt timeout passes.
    ///
    /// The attempt's token is a child of `cancel`, so outer cancellation
    /// reaches an in-flight attempt as well.
    async fn attempt<H>(
        &self,
        check: &H,
        cancel: &CancellationToken,
    ) -> Result<(), HealthCheckError>
    where
        H: HealthCheck + Sync,
    {
        let token = cancel.child_token();
        let attempt = check.check(token.clone());
        tokio::pin!(attempt);

        tokio::select! {
            result = &mut attempt => return result,
            _ = time::sleep(self.attempt_timeout) => {
                log::warn!(
                    target: "sqlbuild::readiness",
                    "Readiness probe exceeded {:?}, cancelling it",
                    self.attempt_timeout
                );
                token.cancel();
            }
        }
        attempt.await
    }
}

impl From<&ReadinessSettings> for ReadinessPoller {
    fn from(settings: &ReadinessSettings) -> Self {
        Self::new(
            settings.interval(),
            settings.attempt_timeout(),
            settings.deadline(),
        )
    }
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::from(&ReadinessSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::HealthCheckFailure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failure(n: usize) -> HealthCheckError {
        HealthCheckError::new("probe", HealthCheckFailure::Cancelled, format!("attempt {}", n))
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HealthCheck for Flaky {
        async fn check(&self, _token: CancellationToken) -> Result<(), HealthCheckError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(failure(n))
            } else {
                Ok(())
            }
        }
    }

    /// Blocks until its token is cancelled, recording that it was.
    struct Stuck {
        cancelled: AtomicUsize,
    }

    impl HealthCheck for Stuck {
        async fn check(&self, token: CancellationToken) -> Result<(), HealthCheckError> {
            token.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn poller() -> ReadinessPoller {
        ReadinessPoller::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(15),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let check = Flaky::new(2);
        let start = Instant::now();

        let result = poller().poll(&check, &CancellationToken::new()).await;

        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(check.calls(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_does_not_wait() {
        let check = Flaky::new(0);
        let start = Instant::now();

        poller().poll(&check, &CancellationToken::new()).await.unwrap();

        assert_eq!(check.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_check_returns_latest_failure_after_deadline() {
        let check = Flaky::new(usize::MAX);
        let start = Instant::now();

        let result = poller().poll(&check, &CancellationToken::new()).await;

        assert!(start.elapsed() >= Duration::from_secs(15));
        let calls = check.calls();
        match result {
            Err(PollError::Unhealthy(e)) => {
                assert_eq!(e.output, format!("attempt {}", calls));
            }
            other => panic!("expected Unhealthy, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_first_retry_skips_further_attempts() {
        let check = Flaky::new(usize::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = poller().poll(&check, &cancel).await;

        assert!(matches!(result, Err(PollError::Cancelled)), "{:?}", result);
        assert_eq!(check.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_between_attempts_stops_polling() {
        let check = Flaky::new(usize::MAX);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let result = poller().poll(&check, &cancel).await;

        assert!(matches!(result, Err(PollError::Cancelled)), "{:?}", result);
        assert_eq!(check.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_attempt_is_expedited_after_attempt_timeout() {
        let check = Stuck {
            cancelled: AtomicUsize::new(0),
        };
        let poller = ReadinessPoller::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
        );
        let start = Instant::now();

        poller.poll(&check, &CancellationToken::new()).await.unwrap();

        assert_eq!(check.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
