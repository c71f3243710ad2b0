/// Outbound notifications for collaborators
///
/// Every component publishes onto a shared `EventBus`. Delivery is
/// fire-and-forget: publishing never fails, even with no subscribers or with
/// subscribers that have fallen behind.
use crate::error::classification::ErrorKind;
use crate::error::dispatcher::ErrorReport;
use crate::error::record::ErrorRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer for the broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Location accuracy levels a collaborator can be asked to switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationAccuracy {
    High,
    Balanced,
    LowPower,
}

/// Remediation intent emitted by recovery strategies
///
/// The subsystem never performs remediation itself. Collaborators subscribe
/// and act on these signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RecoverySignal {
    /// User interaction is needed to grant a permission
    PermissionRequired { kind: ErrorKind, background: bool },

    /// Switch location sampling to a cheaper accuracy level
    AdjustLocationSettings { accuracy: LocationAccuracy },

    /// Fall back to the last known fix
    UseLastKnownLocation,

    /// Re-check whether location services are enabled
    CheckLocationServices,

    /// Reset and reinitialize the local database
    DatabaseReset,

    /// Reopen storage without discarding data
    ReinitializeStorage,

    /// Regenerate a missing encryption key
    RegenerateKey,

    /// Re-check connectivity and re-enqueue pending work
    CheckConnectivity { requeue: bool },

    /// Restart location tracking
    RestartTracking,

    /// Register all geofences again
    ReregisterGeofences,

    /// Schedule the failed background task again
    RescheduleBackgroundTask,
}

/// Events published by the dispatcher, retry executor, queue and registry
#[derive(Debug, Clone)]
pub enum ResilienceEvent {
    /// Every normalized record passing through `dispatch`
    Error(ErrorRecord),

    /// Neither a handler nor a recovery strategy dealt with the report
    UnhandledError(ErrorReport),

    /// A recovery strategy reported success
    RecoverySuccess { kind: ErrorKind, strategy: String },

    /// Every strategy for the kind was tried without success
    RecoveryFailed { kind: ErrorKind, attempts: u32 },

    /// A circuit opened
    CircuitOpen { key: String, failures: u32 },

    /// A circuit started admitting probe calls
    CircuitHalfOpen { key: String },

    /// A circuit closed after successful probes
    CircuitClosed { key: String },

    /// A queued deferred retry eventually succeeded
    RetrySuccess { id: String, attempts: u32 },

    /// A queued deferred retry exhausted its attempts
    RetryFailed {
        id: String,
        attempts: u32,
        error: ErrorRecord,
    },

    /// A recovery strategy asked a collaborator to remediate
    Signal(RecoverySignal),
}

impl ResilienceEvent {
    /// Stable event name, matching the names collaborators subscribe by
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::Error(_) => "error",
            ResilienceEvent::UnhandledError(_) => "unhandledError",
            ResilienceEvent::RecoverySuccess { .. } => "recoverySuccess",
            ResilienceEvent::RecoveryFailed { .. } => "recoveryFailed",
            ResilienceEvent::CircuitOpen { .. } => "circuitOpen",
            ResilienceEvent::CircuitHalfOpen { .. } => "circuitHalfOpen",
            ResilienceEvent::CircuitClosed { .. } => "circuitClosed",
            ResilienceEvent::RetrySuccess { .. } => "retrySuccess",
            ResilienceEvent::RetryFailed { .. } => "retryFailed",
            ResilienceEvent::Signal(_) => "signal",
        }
    }
}

/// Cloneable handle onto a broadcast channel of `ResilienceEvent`
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never fails.
    pub fn emit(&self, event: ResilienceEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            tracing::trace!(event = name, "No subscribers for event");
        }
    }

    /// Shorthand for publishing a recovery signal
    pub fn signal(&self, signal: RecoverySignal) {
        tracing::debug!(signal = ?signal, "Emitting recovery signal");
        self.emit(ResilienceEvent::Signal(signal));
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
