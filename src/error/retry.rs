/// Retry execution with exponential backoff, per-attempt timeout and
/// circuit breaker protection
///
/// `RetryExecutor::with_retry` runs an async operation up to
/// `max_retries + 1` times. Transient failures that eventually succeed never
/// leave this module. Failures that exhaust their attempts are forwarded to
/// the dispatcher once and then returned to the caller.
use super::circuit_breaker::CircuitBreaker;
use super::classification::{ErrorClassifier, Failure};
use super::dispatcher::ErrorDispatcher;
use super::record::{ErrorContext, ErrorRecord};
use crate::config::RetryPolicyConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failed attempt should be retried
pub type RetryCondition = Arc<dyn Fn(&ErrorRecord, u32) -> bool + Send + Sync>;

/// Called before each retry with the failure and the upcoming retry number
pub type RetryCallback = Arc<dyn Fn(&ErrorRecord, u32) + Send + Sync>;

/// Options for one retried operation
#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,

    /// Random spread applied to each delay, 0.0 - 1.0 (default: none)
    pub jitter: f64,

    /// Per-attempt timeout
    pub timeout: Duration,

    /// Defaults to `ErrorRecord::is_retryable`
    pub retry_condition: Option<RetryCondition>,

    pub on_retry: Option<RetryCallback>,
}

impl RetryOptions {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ErrorRecord, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorRecord, u32) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Delay before the retry that follows attempt `attempt_index` (0-based):
    /// `min(initial_delay * backoff_factor^attempt_index, max_delay)`
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        backoff_delay(
            self.initial_delay,
            self.backoff_factor,
            self.max_delay,
            attempt_index,
        )
    }

    /// Backoff delay with jitter applied: `delay ± delay * jitter`
    pub fn retry_delay(&self, attempt_index: u32) -> Duration {
        let delay = self.backoff_delay(attempt_index);
        if self.jitter <= 0.0 {
            return delay;
        }

        let range = delay.as_secs_f64() * self.jitter;
        let spread = (rand::random::<f64>() - 0.5) * 2.0 * range;
        Duration::from_secs_f64((delay.as_secs_f64() + spread).max(0.0))
    }

    pub(crate) fn should_retry(&self, error: &ErrorRecord, attempt_index: u32) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(error, attempt_index),
            None => error.is_retryable(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryOptions {
    fn from(policy: &RetryPolicyConfig) -> Self {
        Self {
            max_retries: policy.max_retries,
            initial_delay: policy.initial_delay,
            max_delay: policy.max_delay,
            backoff_factor: policy.backoff_factor,
            jitter: 0.0,
            timeout: policy.timeout,
            retry_condition: None,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field("retry_condition", &self.retry_condition.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Exponential backoff: `min(initial * factor^attempt_index, max)`
pub fn backoff_delay(
    initial: Duration,
    factor: f64,
    max: Duration,
    attempt_index: u32,
) -> Duration {
    let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
    let nanos = initial.as_nanos() as f64 * factor.powi(exponent);
    let max_nanos = max.as_nanos() as f64;

    if !nanos.is_finite() || nanos >= max_nanos {
        max
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Runs operations with retries, consulting the per-key circuit breaker
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
    dispatcher: Arc<ErrorDispatcher>,
    defaults: RetryPolicyConfig,
}

impl RetryExecutor {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        dispatcher: Arc<ErrorDispatcher>,
        defaults: RetryPolicyConfig,
    ) -> Self {
        Self {
            breaker,
            dispatcher,
            defaults,
        }
    }

    /// Options built from the configured default policy
    pub fn default_options(&self) -> RetryOptions {
        RetryOptions::from(&self.defaults)
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Execute `op` with retries against `resource_key`
    ///
    /// Attempts are strictly sequential. A timed-out attempt is abandoned,
    /// not cancelled: its future is dropped at the timeout.
    ///
    /// If the circuit opens between attempts, the loop stops and the last
    /// real failure is dispatched and returned in place of the breaker's
    /// rejection. A call rejected before its first attempt returns the
    /// `ServiceUnavailable` rejection undispatched.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        mut op: F,
        options: RetryOptions,
        resource_key: &str,
    ) -> Result<T, ErrorRecord>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Failure>,
    {
        let total_attempts = options.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let mut last_error: Option<ErrorRecord> = None;

        loop {
            // Check circuit breaker
            let admission = match self.breaker.admit(resource_key) {
                Ok(admission) => admission,
                Err(rejection) => match last_error {
                    Some(error) => {
                        tracing::error!(
                            resource_key,
                            attempts = attempt,
                            kind = %error.kind,
                            "Circuit opened during retries, giving up"
                        );
                        self.notify_final_failure(&error, resource_key, attempt)
                            .await;
                        return Err(error);
                    }
                    None => return Err(rejection),
                },
            };

            let outcome = match tokio::time::timeout(options.timeout, op()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(ErrorClassifier::normalize(
                    err,
                    Some(ErrorContext::new(resource_key, "retry")),
                )),
                Err(_) => Err(ErrorRecord::timeout(resource_key, options.timeout)),
            };

            match outcome {
                Ok(value) => {
                    admission.succeeded();
                    if attempt > 0 {
                        tracing::info!(
                            resource_key,
                            attempt = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    admission.failed();

                    tracing::warn!(
                        resource_key,
                        attempt = attempt + 1,
                        max_attempts = total_attempts,
                        error = %error,
                        "Operation failed"
                    );

                    let attempts_left = attempt + 1 < total_attempts;
                    if attempts_left && options.should_retry(&error, attempt) {
                        let delay = options.retry_delay(attempt);
                        tracing::info!(
                            resource_key,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after delay"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        if let Some(on_retry) = &options.on_retry {
                            on_retry(&error, attempt);
                        }
                        last_error = Some(error);
                        continue;
                    }

                    let attempts = attempt + 1;
                    tracing::error!(
                        resource_key,
                        attempts,
                        kind = %error.kind,
                        "Giving up on operation"
                    );
                    self.notify_final_failure(&error, resource_key, attempts)
                        .await;
                    return Err(error);
                }
            }
        }
    }

    /// Wrap an operation into a reusable callable that retries on each call
    pub fn wrap<T, E, F, Fut>(
        self: &Arc<Self>,
        op: F,
        options: RetryOptions,
        resource_key: impl Into<String>,
    ) -> impl Fn() -> BoxFuture<'static, Result<T, ErrorRecord>>
    where
        T: Send + 'static,
        E: Into<Failure> + Send + 'static,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let executor = Arc::clone(self);
        let resource_key = resource_key.into();
        move || {
            let executor = Arc::clone(&executor);
            let op = op.clone();
            let options = options.clone();
            let resource_key = resource_key.clone();
            async move { executor.with_retry(op, options, &resource_key).await }.boxed()
        }
    }

    /// One-way notification of an exhausted retry
    async fn notify_final_failure(&self, error: &ErrorRecord, resource_key: &str, attempts: u32) {
        let tagged = error
            .with_metadata("resource_key", resource_key)
            .with_metadata("final_attempt", true)
            .with_metadata("attempts", attempts);
        self.dispatcher.dispatch(tagged, None).await;
    }
}
