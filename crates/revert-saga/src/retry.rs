use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::sleep;
use tracing::warn;

use crate::action::{ActionResult, BoxError};
use crate::context::Context;

/// Configuration for retry behavior with exponential backoff.
///
/// Deserializes from config files as:
///
/// ```toml
/// max_attempts = 5
/// initial_delay_ms = 250
/// multiplier = 2.0
/// ```
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, counting the first one. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Factor applied to the delay after each wait. Values of 1.0 or below keep
    /// the delay constant. Growth is uncapped.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay that follows `delay`, saturating at [`Duration::MAX`].
    fn next_delay(&self, delay: Duration) -> Duration {
        if self.multiplier > 1.0 {
            Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
                .unwrap_or(Duration::MAX)
        } else {
            delay
        }
    }
}

type RetryCallback = Arc<dyn Fn(&BoxError, u32, Duration) + Send + Sync>;

/// Retry decorator for actions.
///
/// Wrapping an action yields another plain action, so retries stay invisible
/// to the workflow: a step either ultimately succeeds or ultimately fails.
///
/// # Example
/// ```ignore
/// let reserve = Retry::new(RetryPolicy::default())
///     .on_retry(|err, attempt, delay| eprintln!("attempt {attempt}: {err}, next in {delay:?}"))
///     .wrap(|ctx| async move { inventory.reserve(&ctx).await });
///
/// let workflow = Workflow::new().step(Step::new("reserve", reserve));
/// ```
#[derive(Clone, Default)]
pub struct Retry {
    policy: RetryPolicy,
    on_retry: Option<RetryCallback>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Retry {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_retry: None,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a callback invoked before each backoff wait.
    ///
    /// Receives the error, the attempt number that failed (1-indexed), and the
    /// delay before the next attempt.
    #[must_use]
    pub fn on_retry<C>(mut self, callback: C) -> Self
    where
        C: Fn(&BoxError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Turn `action` into an action that retries according to this policy.
    pub fn wrap<F, Fut>(
        self,
        action: F,
    ) -> impl Fn(Context) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let action = Arc::new(action);
        move |ctx: Context| {
            let retry = self.clone();
            let action = Arc::clone(&action);
            async move { retry.run(action.as_ref(), &ctx).await }.boxed()
        }
    }

    /// Run `action` until it succeeds, attempts run out, or `ctx` is done.
    ///
    /// # Errors
    ///
    /// Returns the last error of the action once every attempt has failed, or
    /// the [`CancelReason`](crate::CancelReason) as soon as `ctx` is done,
    /// either before an attempt or during a backoff wait.
    pub async fn run<F, Fut>(&self, action: &F, ctx: &Context) -> ActionResult
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = ActionResult>,
    {
        let attempts = self.policy.attempts();
        let mut delay = self.policy.initial_delay;
        let mut attempt = 1u32;

        loop {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }

            let error = match action(ctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if attempt >= attempts {
                return Err(error);
            }

            warn!(
                attempt,
                max_attempts = attempts,
                ?delay,
                %error,
                "action failed, retrying"
            );
            if let Some(ref callback) = self.on_retry {
                callback(&error, attempt, delay);
            }

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason.into()),
                () = sleep(delay) => {}
            }

            delay = self.policy.next_delay(delay);
            attempt += 1;
        }
    }
}

/// Wrap `action` with bounded retries and backoff.
///
/// Shorthand for `Retry::new(policy).wrap(action)`.
pub fn with_retry<F, Fut>(
    policy: RetryPolicy,
    action: F,
) -> impl Fn(Context) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Retry::new(policy).wrap(action)
}

/// Extension trait to decorate an action closure with retries in place.
///
/// # Example
/// ```ignore
/// let step = Step::new(
///     "reserve_ip",
///     (|ctx: Context| async move { ipam.reserve(&ctx).await })
///         .with_retry(RetryPolicy::default()),
/// );
/// ```
pub trait ActionExt<Fut> {
    fn with_retry(
        self,
        policy: RetryPolicy,
    ) -> impl Fn(Context) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static;
}

impl<F, Fut> ActionExt<Fut> for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    fn with_retry(
        self,
        policy: RetryPolicy,
    ) -> impl Fn(Context) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static {
        with_retry(policy, self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::context::CancelReason;

    fn flaky(
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> impl Fn(Context) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static {
        move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                let result: ActionResult = if attempt < failures {
                    Err(format!("failure {}", attempt + 1).into())
                } else {
                    Ok(())
                };
                result
            }
            .boxed()
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn next_delay_grows_only_above_one() {
        let growing = RetryPolicy::default().with_multiplier(3.0);
        assert_eq!(
            growing.next_delay(Duration::from_millis(10)),
            Duration::from_millis(30)
        );

        let constant = RetryPolicy::default().with_multiplier(0.5);
        assert_eq!(
            constant.next_delay(Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn next_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::default().with_multiplier(10.0);
        assert_eq!(policy.next_delay(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn zero_attempts_behaves_as_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).attempts(), 1);
    }

    #[test]
    fn policy_deserializes_from_toml() -> anyhow::Result<()> {
        let policy: RetryPolicy = toml::from_str(
            r"
            max_attempts = 5
            initial_delay_ms = 250
            multiplier = 1.5
            ",
        )?;

        assert_eq!(
            policy,
            RetryPolicy::new(5, Duration::from_millis(250), 1.5)
        );
        Ok(())
    }

    #[test]
    fn missing_policy_keys_fall_back_to_defaults() -> anyhow::Result<()> {
        let policy: RetryPolicy = toml::from_str("max_attempts = 7")?;

        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_delay, RetryPolicy::default().initial_delay);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_attempt_without_waiting() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = with_retry(RetryPolicy::default(), flaky(0, Arc::clone(&calls)));

        let started = Instant::now();
        action(Context::background())
            .await
            .expect("first attempt should succeed");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0);
        let action = with_retry(policy, flaky(2, Arc::clone(&calls)));

        let started = Instant::now();
        action(Context::background())
            .await
            .expect("third attempt should succeed");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_trait_wraps_closures() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = flaky(1, Arc::clone(&calls))
            .with_retry(RetryPolicy::default().with_initial_delay(Duration::from_millis(1)));

        action(Context::background())
            .await
            .expect("second attempt should succeed");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10), 1.0);
        let action = with_retry(policy, flaky(5, Arc::clone(&calls)));

        let error = action(Context::background())
            .await
            .expect_err("every attempt fails");

        assert_eq!(error.to_string(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_consumes_no_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = with_retry(RetryPolicy::default(), flaky(0, Arc::clone(&calls)));
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();

        let error = action(ctx).await.expect_err("cancelled before start");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            error.downcast_ref::<CancelReason>(),
            Some(&CancelReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_is_abortable() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_secs(3600), 1.0);
        let action = with_retry(policy, flaky(5, Arc::clone(&calls)));
        let ctx = Context::background().with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let error = action(ctx).await.expect_err("deadline hits during backoff");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(
            error.downcast_ref::<CancelReason>(),
            Some(&CancelReason::DeadlineExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_observes_every_backoff() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let calls = Arc::new(AtomicU32::new(0));

        let action = Retry::new(RetryPolicy::new(4, Duration::from_millis(5), 2.0))
            .on_retry(move |error, attempt, delay| {
                recorder
                    .lock()
                    .expect("recorder lock")
                    .push((error.to_string(), attempt, delay));
            })
            .wrap(flaky(3, Arc::clone(&calls)));

        action(Context::background())
            .await
            .expect("fourth attempt should succeed");

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(
            *seen,
            vec![
                (String::from("failure 1"), 1, Duration::from_millis(5)),
                (String::from("failure 2"), 2, Duration::from_millis(10)),
                (String::from("failure 3"), 3, Duration::from_millis(20)),
            ]
        );
    }
}
