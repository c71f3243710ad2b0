/// Recovery strategy registry
///
/// Strategies are registered per error kind and tried in registration order;
/// the first one reporting success wins. Strategies orchestrate only: they
/// emit `RecoverySignal`s and let collaborators do the actual remediation.
///
/// `with_auto_recovery` composes an operation with the registry: failures of
/// a targeted kind run recovery before the operation is attempted again.
/// Its attempt loop is separate from `RetryExecutor`'s backoff loop.
use super::classification::{ErrorClassifier, ErrorKind, Failure};
use super::record::{ErrorContext, ErrorRecord};
use super::run_guarded;
use super::strategies;
use crate::events::{EventBus, ResilienceEvent};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Input handed to each strategy
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub error: ErrorRecord,

    /// 1-based attempt number for this error
    pub attempts: u32,

    pub last_attempt_time: DateTime<Utc>,
}

impl RecoveryContext {
    pub fn new(error: ErrorRecord, attempts: u32) -> Self {
        Self {
            error,
            attempts,
            last_attempt_time: Utc::now(),
        }
    }
}

/// Remediation function. `Ok(true)` means recovered.
pub type RecoveryStrategy =
    Arc<dyn Fn(RecoveryContext) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Clone)]
struct NamedStrategy {
    name: String,
    run: RecoveryStrategy,
}

pub struct RecoveryRegistry {
    strategies: RwLock<HashMap<ErrorKind, Vec<NamedStrategy>>>,
    events: EventBus,
}

impl RecoveryRegistry {
    /// Empty registry
    pub fn new(events: EventBus) -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Registry preloaded with the built-in strategies
    pub fn with_builtin_strategies(events: EventBus) -> Self {
        let registry = Self::new(events);
        strategies::register_builtin(&registry);
        registry
    }

    /// Append a strategy to the kind's list
    pub fn register_strategy<F, Fut>(&self, kind: ErrorKind, name: impl Into<String>, strategy: F)
    where
        F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(kind = %kind, strategy = %name, "Registering recovery strategy");
        let run: RecoveryStrategy = Arc::new(move |ctx| strategy(ctx).boxed());
        self.strategies
            .write()
            .entry(kind)
            .or_default()
            .push(NamedStrategy { name, run });
    }

    pub fn has_strategies(&self, kind: ErrorKind) -> bool {
        self.strategies
            .read()
            .get(&kind)
            .is_some_and(|list| !list.is_empty())
    }

    /// Names of the kind's strategies, in execution order
    pub fn strategy_names(&self, kind: ErrorKind) -> Vec<String> {
        self.strategies
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Try each strategy for the error's kind until one succeeds
    ///
    /// A strategy that fails or panics counts as not recovering.
    pub async fn execute(&self, ctx: RecoveryContext) -> bool {
        let kind = ctx.error.kind;
        let list = self
            .strategies
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if list.is_empty() {
            tracing::debug!(kind = %kind, "No recovery strategies registered");
            return false;
        }

        for strategy in &list {
            match run_guarded(|| (strategy.run)(ctx.clone())).await {
                Ok(true) => {
                    tracing::info!(
                        kind = %kind,
                        strategy = %strategy.name,
                        attempt = ctx.attempts,
                        "Recovery succeeded"
                    );
                    self.events.emit(ResilienceEvent::RecoverySuccess {
                        kind,
                        strategy: strategy.name.clone(),
                    });
                    return true;
                }
                Ok(false) => {
                    tracing::debug!(
                        kind = %kind,
                        strategy = %strategy.name,
                        attempt = ctx.attempts,
                        "Recovery strategy did not recover"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        kind = %kind,
                        strategy = %strategy.name,
                        error = %e,
                        "Recovery strategy failed"
                    );
                }
            }
        }

        tracing::warn!(kind = %kind, attempt = ctx.attempts, "All recovery strategies exhausted");
        self.events.emit(ResilienceEvent::RecoveryFailed {
            kind,
            attempts: ctx.attempts,
        });
        false
    }
}

/// Options for `with_auto_recovery`
#[derive(Debug, Clone)]
pub struct AutoRecoveryOptions {
    /// Total attempts of the wrapped operation
    pub max_attempts: u32,

    /// Kinds recovery is attempted for. `None` means any kind.
    pub target_kinds: Option<HashSet<ErrorKind>>,

    /// Pause between attempts. `None` uses the failure's own retry delay.
    pub retry_delay: Option<Duration>,
}

impl AutoRecoveryOptions {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn targeting(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.target_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    fn targets(&self, kind: ErrorKind) -> bool {
        self.target_kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

impl Default for AutoRecoveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            target_kinds: None,
            retry_delay: None,
        }
    }
}

/// Run `op`, invoking recovery between attempts for targeted kinds
///
/// Untargeted failures and failed recoveries are returned immediately.
pub async fn with_auto_recovery<T, E, F, Fut>(
    registry: &RecoveryRegistry,
    mut op: F,
    options: &AutoRecoveryOptions,
    context: Option<ErrorContext>,
) -> Result<T, ErrorRecord>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt: u32 = 1;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => ErrorClassifier::normalize(err, context.clone()),
        };

        if !options.targets(error.kind) {
            return Err(error);
        }

        // Strategies only run when a retry will follow
        if attempt >= max_attempts {
            tracing::debug!(kind = %error.kind, attempt, "Auto-recovery attempts exhausted");
            return Err(error);
        }

        let recovered = registry.execute(RecoveryContext::new(error.clone(), attempt)).await;
        if !recovered {
            tracing::debug!(kind = %error.kind, attempt, "Auto-recovery giving up");
            return Err(error);
        }

        let delay = options.retry_delay.unwrap_or_else(|| error.retry_delay());
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Wrap an operation into a reusable callable with auto-recovery
pub fn auto_recover<T, E, F, Fut>(
    registry: Arc<RecoveryRegistry>,
    op: F,
    options: AutoRecoveryOptions,
) -> impl Fn() -> BoxFuture<'static, Result<T, ErrorRecord>>
where
    T: Send + 'static,
    E: Into<Failure> + Send + 'static,
    F: Fn() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    move || {
        let registry = Arc::clone(&registry);
        let op = op.clone();
        let options = options.clone();
        async move { with_auto_recovery(&registry, op, &options, None).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> RecoveryRegistry {
        RecoveryRegistry::new(EventBus::default())
    }

    fn ctx(kind: ErrorKind, attempts: u32) -> RecoveryContext {
        RecoveryContext::new(ErrorRecord::from_kind(kind), attempts)
    }

    #[tokio::test]
    async fn test_empty_registry_does_not_recover() {
        assert!(!registry().execute(ctx(ErrorKind::Unknown, 1)).await);
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let registry = registry();
        let mut rx = registry.events().subscribe();
        let later = Arc::new(AtomicU32::new(0));
        let l = Arc::clone(&later);

        registry.register_strategy(ErrorKind::Unknown, "no", |_| async { Ok(false) });
        registry.register_strategy(ErrorKind::Unknown, "yes", |_| async { Ok(true) });
        registry.register_strategy(ErrorKind::Unknown, "never-reached", move |_| {
            l.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        });

        assert!(registry.execute(ctx(ErrorKind::Unknown, 1)).await);
        assert_eq!(later.load(Ordering::SeqCst), 0);

        match rx.try_recv().unwrap() {
            ResilienceEvent::RecoverySuccess { strategy, .. } => assert_eq!(strategy, "yes"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_strategy_behaves_as_false() {
        let registry = registry();
        registry.register_strategy(ErrorKind::Unknown, "err", |_| async {
            Err(anyhow::anyhow!("strategy error"))
        });
        registry.register_strategy(ErrorKind::Unknown, "ok", |_| async { Ok(true) });
        assert!(registry.execute(ctx(ErrorKind::Unknown, 1)).await);

        let only_failing = RecoveryRegistry::new(EventBus::default());
        let mut rx = only_failing.events().subscribe();
        only_failing.register_strategy(ErrorKind::Unknown, "err", |_| async {
            Err(anyhow::anyhow!("strategy error"))
        });
        assert!(!only_failing.execute(ctx(ErrorKind::Unknown, 2)).await);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ResilienceEvent::RecoveryFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_strategies_are_per_kind() {
        let registry = registry();
        registry.register_strategy(ErrorKind::NetworkUnavailable, "net", |_| async { Ok(true) });

        assert!(registry.has_strategies(ErrorKind::NetworkUnavailable));
        assert!(!registry.has_strategies(ErrorKind::StorageFull));
        assert!(!registry.execute(ctx(ErrorKind::StorageFull, 1)).await);
        assert_eq!(registry.strategy_names(ErrorKind::NetworkUnavailable), vec!["net"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recovery_retries_after_recovery() {
        let registry = registry();
        registry.register_strategy(ErrorKind::LocationTimeout, "relax", |_| async { Ok(true) });
        let calls = AtomicU32::new(0);

        let result = with_auto_recovery(
            &registry,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ErrorRecord::from_kind(ErrorKind::LocationTimeout))
                    } else {
                        Ok(n)
                    }
                }
            },
            &AutoRecoveryOptions::new(3).targeting([ErrorKind::LocationTimeout]),
            None,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recovery_rethrows_when_recovery_fails() {
        let registry = registry();
        registry.register_strategy(ErrorKind::LocationTimeout, "nope", |_| async { Ok(false) });
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_auto_recovery(
            &registry,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ErrorRecord::from_kind(ErrorKind::LocationTimeout)) }
            },
            &AutoRecoveryOptions::new(5),
            None,
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::LocationTimeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recovery_ignores_untargeted_kinds() {
        let registry = registry();
        let invoked = Arc::new(AtomicU32::new(0));
        let i = Arc::clone(&invoked);
        registry.register_strategy(ErrorKind::StorageFull, "free", move |_| {
            i.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        });

        let result: Result<(), _> = with_auto_recovery(
            &registry,
            || async { Err(ErrorRecord::from_kind(ErrorKind::StorageFull)) },
            &AutoRecoveryOptions::new(3).targeting([ErrorKind::LocationTimeout]),
            None,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recover_combinator_passes_attempt_numbers() {
        let registry = Arc::new(registry());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        registry.register_strategy(ErrorKind::Unknown, "record", move |ctx| {
            s.lock().push(ctx.attempts);
            async { Ok(true) }
        });

        let wrapped = auto_recover(
            Arc::clone(&registry),
            || async { Err::<(), _>("mystery failure") },
            AutoRecoveryOptions::new(3).with_retry_delay(Duration::from_millis(5)),
        );

        assert_eq!(wrapped().await.unwrap_err().kind, ErrorKind::Unknown);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_strategy_panicking_before_its_future_is_contained() {
        let registry = registry();
        registry.register_strategy(
            ErrorKind::Unknown,
            "explodes",
            |_| -> futures::future::Ready<anyhow::Result<bool>> { panic!("strategy exploded") },
        );
        registry.register_strategy(ErrorKind::Unknown, "ok", |_| async { Ok(true) });

        assert!(registry.execute(ctx(ErrorKind::Unknown, 1)).await);
    }
}
