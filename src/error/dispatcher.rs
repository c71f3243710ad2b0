/// Central error dispatcher
///
/// `ErrorDispatcher::dispatch` is the single entry point for failures. It:
/// - Normalizes the failure into an `ErrorRecord`
/// - Records a report in bounded, insertion-ordered history
/// - Publishes an `error` event and logs by severity
/// - Forwards non-Low errors to the configured reporter
/// - Runs kind-specific handlers, then global handlers
/// - Falls back to the recovery registry for unhandled retryable errors
use super::classification::{ErrorClassifier, ErrorKind, Failure, Severity};
use super::record::{ErrorContext, ErrorRecord};
use super::recovery::{RecoveryContext, RecoveryRegistry};
use super::run_guarded;
use crate::events::{EventBus, ResilienceEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Handler invoked for a dispatched record. `Ok(true)` marks it handled.
pub type ErrorHandler =
    Arc<dyn Fn(ErrorRecord) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// External sink for dispatched errors (crash reporting, telemetry)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, error: &ErrorRecord, context: &ErrorContext) -> anyhow::Result<()>;
}

/// Outcome of one `dispatch` call
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub id: Uuid,
    pub record: ErrorRecord,
    pub handled: bool,
    pub recovered: bool,
    pub retry_count: u32,
    pub dispatched_at: DateTime<Utc>,
}

impl ErrorReport {
    fn new(record: ErrorRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            record,
            handled: false,
            recovered: false,
            retry_count: 0,
            dispatched_at: Utc::now(),
        }
    }
}

/// Read-only view over dispatch history
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total: usize,
    pub by_kind: HashMap<ErrorKind, usize>,
    pub by_severity: HashMap<Severity, usize>,
    pub recovered: usize,
    /// `recovered / total * 100`, 0 when history is empty
    pub recovery_rate: f64,
    pub critical_count: usize,
    /// Newest first
    pub recent: Vec<ErrorReport>,
}

/// Number of reports included in `ErrorStatistics::recent`
pub const RECENT_ERRORS: usize = 10;

pub struct ErrorDispatcher {
    capacity: usize,
    development_mode: bool,
    history: Mutex<VecDeque<ErrorReport>>,
    handlers: RwLock<HashMap<ErrorKind, Vec<ErrorHandler>>>,
    global_handlers: RwLock<Vec<ErrorHandler>>,
    /// Recovery attempts per (kind, operation)
    recovery_attempts: Mutex<HashMap<(ErrorKind, String), u32>>,
    recovery: Arc<RecoveryRegistry>,
    reporter: RwLock<Option<Arc<dyn ErrorReporter>>>,
    events: EventBus,
}

impl ErrorDispatcher {
    pub fn new(
        capacity: usize,
        development_mode: bool,
        recovery: Arc<RecoveryRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            development_mode,
            history: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            handlers: RwLock::new(HashMap::new()),
            global_handlers: RwLock::new(Vec::new()),
            recovery_attempts: Mutex::new(HashMap::new()),
            recovery,
            reporter: RwLock::new(None),
            events,
        }
    }

    /// Dispatch a failure through the full pipeline
    pub async fn dispatch(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
    ) -> ErrorReport {
        let record = ErrorClassifier::normalize(failure, context);
        let mut report = ErrorReport::new(record.clone());

        {
            let mut history = self.history.lock();
            history.push_back(report.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }

        self.events.emit(ResilienceEvent::Error(record.clone()));
        self.log(&record);
        self.forward_to_reporter(&record);

        let handled = self.run_handlers(&record).await;

        let mut recovered = false;
        if !handled && record.is_retryable() {
            let (success, attempts) = self.attempt_recovery(&record).await;
            recovered = success;
            report.retry_count = attempts;
        }

        report.handled = handled;
        report.recovered = recovered;
        self.update_history(&report);

        if !handled && !recovered {
            self.events
                .emit(ResilienceEvent::UnhandledError(report.clone()));
        }

        report
    }

    /// Register a handler for one kind. Handlers run in registration order.
    pub fn register_handler<F, Fut>(&self, kind: ErrorKind, handler: F)
    where
        F: Fn(ErrorRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |record| handler(record).boxed());
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Register a handler consulted when no kind-specific handler handled
    /// the error
    pub fn register_global_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ErrorRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |record| handler(record).boxed());
        self.global_handlers.write().push(handler);
    }

    pub fn unregister_handlers(&self, kind: ErrorKind) {
        self.handlers.write().remove(&kind);
    }

    pub fn clear_global_handlers(&self) {
        self.global_handlers.write().clear();
    }

    pub fn set_reporter(&self, reporter: Arc<dyn ErrorReporter>) {
        *self.reporter.write() = Some(reporter);
    }

    pub fn clear_reporter(&self) {
        *self.reporter.write() = None;
    }

    pub fn recovery(&self) -> &Arc<RecoveryRegistry> {
        &self.recovery
    }

    /// History in dispatch order, oldest first
    pub fn history(&self) -> Vec<ErrorReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// The `count` most recent reports, newest first
    pub fn recent_errors(&self, count: usize) -> Vec<ErrorReport> {
        self.history
            .lock()
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let history = self.history.lock();

        let mut by_kind = HashMap::new();
        let mut by_severity = HashMap::new();
        let mut recovered = 0;
        let mut critical_count = 0;

        for report in history.iter() {
            *by_kind.entry(report.record.kind).or_insert(0) += 1;
            *by_severity.entry(report.record.severity).or_insert(0) += 1;
            if report.recovered {
                recovered += 1;
            }
            if report.record.is_critical() {
                critical_count += 1;
            }
        }

        let total = history.len();
        let recovery_rate = if total == 0 {
            0.0
        } else {
            recovered as f64 / total as f64 * 100.0
        };

        ErrorStatistics {
            total,
            by_kind,
            by_severity,
            recovered,
            recovery_rate,
            critical_count,
            recent: history.iter().rev().take(RECENT_ERRORS).cloned().collect(),
        }
    }

    /// Whether a Critical error was dispatched in the last `within_minutes`
    ///
    /// A window reaching past the representable time range covers the whole
    /// history.
    pub fn has_critical_errors(&self, within_minutes: i64) -> bool {
        let cutoff = chrono::Duration::try_minutes(within_minutes)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        self.history.lock().iter().any(|report| {
            report.record.is_critical()
                && cutoff.map_or(true, |cutoff| report.dispatched_at >= cutoff)
        })
    }

    /// Drop all history and recovery-attempt bookkeeping
    pub fn clear_history(&self) {
        self.history.lock().clear();
        self.recovery_attempts.lock().clear();
        tracing::debug!("Error history cleared");
    }

    fn log(&self, record: &ErrorRecord) {
        match record.severity {
            Severity::Critical | Severity::High => tracing::error!(
                kind = %record.kind,
                severity = %record.severity,
                operation = %record.context.operation,
                component = %record.context.component,
                "{}",
                record.message
            ),
            Severity::Medium => tracing::warn!(
                kind = %record.kind,
                operation = %record.context.operation,
                component = %record.context.component,
                "{}",
                record.message
            ),
            Severity::Low => {
                if self.development_mode {
                    tracing::debug!(
                        kind = %record.kind,
                        operation = %record.context.operation,
                        "{}",
                        record.message
                    );
                }
            }
        }
    }

    fn forward_to_reporter(&self, record: &ErrorRecord) {
        if record.severity <= Severity::Low {
            return;
        }
        let Some(reporter) = self.reporter.read().clone() else {
            return;
        };

        let record = record.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.report(&record, &record.context).await {
                tracing::warn!(
                    kind = %record.kind,
                    error = %e,
                    "Error reporter failed"
                );
            }
        });
    }

    async fn run_handlers(&self, record: &ErrorRecord) -> bool {
        let specific = self
            .handlers
            .read()
            .get(&record.kind)
            .cloned()
            .unwrap_or_default();
        if Self::run_chain(&specific, record, "kind").await {
            return true;
        }

        let global = self.global_handlers.read().clone();
        Self::run_chain(&global, record, "global").await
    }

    async fn run_chain(handlers: &[ErrorHandler], record: &ErrorRecord, chain: &str) -> bool {
        for (index, handler) in handlers.iter().enumerate() {
            match run_guarded(|| handler(record.clone())).await {
                Ok(true) => {
                    tracing::debug!(kind = %record.kind, chain, index, "Error handled");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        kind = %record.kind,
                        chain,
                        index,
                        error = %e,
                        "Error handler failed"
                    );
                }
            }
        }
        false
    }

    /// Run recovery unless this (kind, operation) already used its budget
    async fn attempt_recovery(&self, record: &ErrorRecord) -> (bool, u32) {
        let key = (record.kind, record.context.operation.clone());
        let previous = self
            .recovery_attempts
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(0);

        if previous >= record.recovery.max_retries {
            tracing::debug!(
                kind = %record.kind,
                attempts = previous,
                "Recovery budget exhausted"
            );
            return (false, previous);
        }

        let attempts = previous + 1;
        let recovered = self
            .recovery
            .execute(RecoveryContext {
                error: record.clone(),
                attempts,
                last_attempt_time: Utc::now(),
            })
            .await;

        let mut bookkeeping = self.recovery_attempts.lock();
        if recovered {
            bookkeeping.remove(&key);
        } else {
            bookkeeping.insert(key, attempts);
        }
        (recovered, attempts)
    }

    fn update_history(&self, report: &ErrorReport) {
        let mut history = self.history.lock();
        if let Some(entry) = history.iter_mut().find(|entry| entry.id == report.id) {
            entry.handled = report.handled;
            entry.recovered = report.recovered;
            entry.retry_count = report.retry_count;
        }
    }
}
