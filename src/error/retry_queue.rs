/// Deferred retry queue
///
/// Fire-and-forget retries keyed by a caller-supplied id. A background
/// scanner wakes every `scan_interval`, snapshots the entries that are due
/// and attempts each once. Failures are rescheduled with the same backoff
/// rule as `RetryExecutor`; only an exhausted entry reaches the dispatcher.
///
/// Re-queuing an id replaces the prior entry. Every entry carries a
/// generation number so a scan never writes back over an entry that was
/// cancelled or replaced while its attempt was running.
use super::classification::{ErrorClassifier, Failure};
use super::dispatcher::ErrorDispatcher;
use super::record::{ErrorContext, ErrorRecord};
use super::retry::RetryOptions;
use crate::events::{EventBus, ResilienceEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

type QueuedOperation =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), ErrorRecord>> + Send + Sync>;

struct QueueEntry {
    generation: u64,
    operation: QueuedOperation,
    options: RetryOptions,
    /// Attempts made so far
    attempts: u32,
    last_error: Option<ErrorRecord>,
    next_retry_at: Instant,
}

/// Work picked up by one scan
struct DueEntry {
    id: String,
    generation: u64,
    operation: QueuedOperation,
    options: RetryOptions,
}

enum Settled {
    Succeeded { attempts: u32 },
    Rescheduled { attempts: u32, delay: Duration },
    Exhausted { attempts: u32, error: ErrorRecord },
}

pub struct RetryQueue {
    entries: Mutex<HashMap<String, QueueEntry>>,
    generation: AtomicU64,
    scan_interval: Duration,
    scanner: Mutex<Option<JoinHandle<()>>>,
    /// Held for the length of a scan so overlapping scans never attempt
    /// the same entry twice
    scan_lock: tokio::sync::Mutex<()>,
    dispatcher: Arc<ErrorDispatcher>,
    events: EventBus,
}

impl RetryQueue {
    pub fn new(
        scan_interval: Duration,
        dispatcher: Arc<ErrorDispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            scan_interval,
            scanner: Mutex::new(None),
            scan_lock: tokio::sync::Mutex::new(()),
            dispatcher,
            events,
        }
    }

    /// Queue `op` for deferred retry under `id`
    ///
    /// The first attempt runs on the next scan. The scanner is started on
    /// demand when a tokio runtime is available.
    pub fn queue_for_retry<T, E, F, Fut>(
        self: &Arc<Self>,
        id: impl Into<String>,
        op: F,
        options: RetryOptions,
    )
    where
        T: Send + 'static,
        E: Into<Failure> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = id.into();
        let operation_id = id.clone();
        let operation: QueuedOperation = Arc::new(move || {
            let attempt = op();
            let operation_id = operation_id.clone();
            async move {
                attempt.await.map(|_| ()).map_err(|err| {
                    let context = ErrorContext::new(operation_id, "retry_queue");
                    ErrorClassifier::normalize(err, Some(context))
                })
            }
            .boxed()
        });

        let entry = QueueEntry {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            operation,
            options,
            attempts: 0,
            last_error: None,
            next_retry_at: Instant::now(),
        };

        if self.entries.lock().insert(id.clone(), entry).is_some() {
            tracing::debug!(id = %id, "Replaced queued retry");
        } else {
            tracing::debug!(id = %id, "Queued retry");
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            self.start();
        } else {
            tracing::warn!(id = %id, "No async runtime, queued retry waits for an explicit scan");
        }
    }

    /// Remove a queued retry, returning whether one existed
    pub fn cancel_retry(&self, id: &str) -> bool {
        let removed = self.entries.lock().remove(id).is_some();
        if removed {
            tracing::debug!(id, "Cancelled queued retry");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Attempts made so far and the last failure for a queued id
    pub fn entry_state(&self, id: &str) -> Option<(u32, Option<ErrorRecord>)> {
        self.entries
            .lock()
            .get(id)
            .map(|entry| (entry.attempts, entry.last_error.clone()))
    }

    /// Start the periodic scanner if it is not already running
    ///
    /// Must be called within a tokio runtime. The scanner holds only a weak
    /// reference and exits once the queue is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut scanner = self.scanner.lock();
        if scanner.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        let period = self.scan_interval;
        *scanner = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.process_due().await;
            }
            tracing::debug!("Retry queue scanner stopped");
        }));

        tracing::debug!(interval = ?period, "Retry queue scanner started");
    }

    /// Stop the scanner; queued entries are kept
    pub fn shutdown(&self) {
        if let Some(handle) = self.scanner.lock().take() {
            handle.abort();
        }
    }

    /// Attempt every entry that is due now, returning how many were attempted
    ///
    /// Entries queued while the scan runs wait for the next one. A call
    /// made while another scan is running waits for it to finish first.
    pub async fn process_due(&self) -> usize {
        let _scan = self.scan_lock.lock().await;
        let now = Instant::now();
        let due: Vec<DueEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.next_retry_at <= now)
            .map(|(id, entry)| DueEntry {
                id: id.clone(),
                generation: entry.generation,
                operation: Arc::clone(&entry.operation),
                options: entry.options.clone(),
            })
            .collect();

        let attempted = due.len();
        for entry in due {
            let attempt = tokio::time::timeout(entry.options.timeout, (entry.operation)());
            let outcome = match attempt.await {
                Ok(result) => result,
                Err(_) => Err(ErrorRecord::timeout(&entry.id, entry.options.timeout)),
            };

            if let Some(settled) = self.settle(&entry, outcome) {
                self.announce(&entry.id, settled).await;
            }
        }
        attempted
    }

    /// Apply an attempt's outcome to its entry, unless it was cancelled or
    /// replaced in the meantime
    fn settle(&self, due: &DueEntry, outcome: Result<(), ErrorRecord>) -> Option<Settled> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&due.id)
            .filter(|entry| entry.generation == due.generation)?;

        entry.attempts += 1;
        let attempts = entry.attempts;

        match outcome {
            Ok(()) => {
                entries.remove(&due.id);
                Some(Settled::Succeeded { attempts })
            }
            Err(error) => {
                let total_attempts = entry.options.max_retries.saturating_add(1);
                let attempt_index = attempts - 1;

                if attempts < total_attempts && entry.options.should_retry(&error, attempt_index) {
                    let delay = entry.options.retry_delay(attempt_index);
                    entry.next_retry_at = Instant::now() + delay;
                    entry.last_error = Some(error);
                    Some(Settled::Rescheduled { attempts, delay })
                } else {
                    entries.remove(&due.id);
                    Some(Settled::Exhausted { attempts, error })
                }
            }
        }
    }

    async fn announce(&self, id: &str, settled: Settled) {
        match settled {
            Settled::Succeeded { attempts } => {
                tracing::info!(id, attempts, "Queued retry succeeded");
                self.events.emit(ResilienceEvent::RetrySuccess {
                    id: id.to_string(),
                    attempts,
                });
            }
            Settled::Rescheduled { attempts, delay } => {
                tracing::debug!(
                    id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Queued retry rescheduled"
                );
            }
            Settled::Exhausted { attempts, error } => {
                tracing::error!(id, attempts, kind = %error.kind, "Queued retry exhausted");
                self.events.emit(ResilienceEvent::RetryFailed {
                    id: id.to_string(),
                    attempts,
                    error: error.clone(),
                });
                let tagged = error
                    .with_metadata("retry_id", id)
                    .with_metadata("final_attempt", true)
                    .with_metadata("attempts", attempts);
                self.dispatcher.dispatch(tagged, None).await;
            }
        }
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
