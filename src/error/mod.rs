/// Error resilience system for Waypoint
///
/// This module provides the failure-handling framework including:
/// - Error taxonomy, default policy tables and normalization
/// - A central dispatcher with bounded history, handler chains and reporting
/// - Retry execution with exponential backoff and per-attempt timeouts
/// - Per-resource-key circuit breakers
/// - A deferred retry queue with a background scanner
/// - A recovery strategy registry with built-in, signal-emitting strategies
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────────────────────────┐
/// │         Error Dispatcher (entry)         │
/// └────────────────┬────────────────────────┘
///                  │
///      ┌───────────┴───────────┐
///      ↓                       ↓
/// ┌──────────────┐      ┌──────────────────┐
/// │Classification│      │ Recovery Registry │
/// │  & Records   │      │  + Strategies     │
/// └──────────────┘      └──────────────────┘
///      ↑
///      │ final failures
/// ┌─────────────────────────────────────┐
/// │  Retry Executor + Circuit Breaker   │
/// │  Deferred Retry Queue               │
/// └─────────────────────────────────────┘
/// ```
///
/// # Usage Example
///
/// ```rust,ignore
/// use waypoint_resilience::error::{ErrorContext, ErrorKind, RetryOptions};
/// use waypoint_resilience::Resilience;
///
/// let resilience = Resilience::new(Default::default())?;
///
/// resilience.dispatcher().register_handler(ErrorKind::PermissionDenied, |record| async move {
///     show_permission_prompt(&record.user_message).await;
///     Ok(true)
/// });
///
/// let batch = resilience
///     .executor()
///     .with_retry(|| upload_batch(), RetryOptions::new(3), "sync-api")
///     .await?;
/// # Ok::<(), anyhow::Error>(())
/// ```

pub mod circuit_breaker;
pub mod classification;
pub mod dispatcher;
pub mod record;
pub mod recovery;
pub mod retry;
pub mod retry_queue;
pub mod strategies;

// Re-export main types for convenience
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState, CircuitStatus};
pub use classification::{ErrorClassifier, ErrorDomain, ErrorKind, Failure, KindDefaults, Severity};
pub use dispatcher::{ErrorDispatcher, ErrorHandler, ErrorReport, ErrorReporter, ErrorStatistics};
pub use record::{ErrorContext, ErrorRecord, ErrorRecordBuilder, RecoveryPolicy, UserMessage};
pub use recovery::{
    auto_recover, with_auto_recovery, AutoRecoveryOptions, RecoveryContext, RecoveryRegistry,
    RecoveryStrategy,
};
pub use retry::{backoff_delay, RetryExecutor, RetryOptions};
pub use retry_queue::RetryQueue;

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Invoke a handler or strategy and await it, turning a panic in either
/// the call or the returned future into an error
pub(crate) async fn run_guarded<F, Fut>(invoke: F) -> anyhow::Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    match AssertUnwindSafe(async move { invoke().await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
