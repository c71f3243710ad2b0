/// Network recovery: re-check connectivity and re-enqueue pending work
use super::register_stepped;
use crate::error::classification::ErrorKind;
use crate::error::recovery::RecoveryRegistry;
use crate::events::RecoverySignal;

/// Attempts that still request a connectivity check
pub const MAX_CONNECTIVITY_CHECKS: u32 = 3;

pub fn check_connectivity(attempt: u32) -> Option<RecoverySignal> {
    (attempt <= MAX_CONNECTIVITY_CHECKS)
        .then_some(RecoverySignal::CheckConnectivity { requeue: true })
}

pub fn register(registry: &RecoveryRegistry) {
    for kind in [
        ErrorKind::NetworkUnavailable,
        ErrorKind::NetworkTimeout,
        ErrorKind::ServiceUnavailable,
    ] {
        register_stepped(registry, kind, "check_connectivity", check_connectivity);
    }
}
