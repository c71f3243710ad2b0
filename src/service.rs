/// Composition root wiring the dispatcher, breaker, executor, queue and
/// recovery registry onto one event bus
use crate::config::{ConfigError, ResilienceConfig};
use crate::error::{
    CircuitBreaker, CircuitStatus, ErrorContext, ErrorDispatcher, ErrorRecord, ErrorReport,
    Failure, RecoveryRegistry, RetryExecutor, RetryOptions, RetryQueue,
};
use crate::events::{EventBus, ResilienceEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

lazy_static::lazy_static! {
    static ref GLOBAL: Resilience = Resilience::build(
        ResilienceConfig::load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Falling back to default resilience configuration");
            ResilienceConfig::default()
        })
    );
}

/// Process-wide instance, configured from the default file and environment
pub fn global() -> &'static Resilience {
    &GLOBAL
}

pub struct Resilience {
    config: ResilienceConfig,
    events: EventBus,
    dispatcher: Arc<ErrorDispatcher>,
    breaker: Arc<CircuitBreaker>,
    executor: Arc<RetryExecutor>,
    queue: Arc<RetryQueue>,
}

impl Resilience {
    /// Build a service with the built-in recovery strategies registered
    pub fn new(config: ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ResilienceConfig) -> Self {
        let events = EventBus::default();
        let recovery = Arc::new(RecoveryRegistry::with_builtin_strategies(events.clone()));
        let dispatcher = Arc::new(ErrorDispatcher::new(
            config.history_capacity,
            config.development_mode,
            recovery,
            events.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            events.clone(),
        ));
        let executor = Arc::new(RetryExecutor::new(
            Arc::clone(&breaker),
            Arc::clone(&dispatcher),
            config.retry.clone(),
        ));
        let queue = Arc::new(RetryQueue::new(
            config.queue_scan_interval,
            Arc::clone(&dispatcher),
            events.clone(),
        ));

        tracing::debug!(
            history_capacity = config.history_capacity,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "Resilience service initialized"
        );

        Self {
            config,
            events,
            dispatcher,
            breaker,
            executor,
            queue,
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn dispatcher(&self) -> &Arc<ErrorDispatcher> {
        &self.dispatcher
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn recovery(&self) -> &Arc<RecoveryRegistry> {
        self.dispatcher.recovery()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.events.subscribe()
    }

    pub async fn dispatch(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
    ) -> ErrorReport {
        self.dispatcher.dispatch(failure, context).await
    }

    /// Options built from the configured retry policy
    pub fn retry_options(&self) -> RetryOptions {
        self.executor.default_options()
    }

    pub async fn with_retry<T, E, F, Fut>(
        &self,
        op: F,
        options: RetryOptions,
        resource_key: &str,
    ) -> Result<T, ErrorRecord>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Failure>,
    {
        self.executor.with_retry(op, options, resource_key).await
    }

    pub fn queue_for_retry<T, E, F, Fut>(&self, id: impl Into<String>, op: F, options: RetryOptions)
    where
        T: Send + 'static,
        E: Into<Failure> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.queue.queue_for_retry(id, op, options);
    }

    pub fn cancel_retry(&self, id: &str) -> bool {
        self.queue.cancel_retry(id)
    }

    pub fn circuit_status(&self, resource_key: &str) -> CircuitStatus {
        self.breaker.status(resource_key)
    }

    pub fn reset_circuit(&self, resource_key: &str) {
        self.breaker.reset(resource_key);
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl Default for Resilience {
    fn default() -> Self {
        Self::build(ResilienceConfig::default())
    }
}

impl Drop for Resilience {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}
