/// Location recovery: progressively cheaper sampling, then last known fix
use super::{register_notify_only, register_stepped};
use crate::error::classification::ErrorKind;
use crate::error::recovery::RecoveryRegistry;
use crate::events::{LocationAccuracy, RecoverySignal};

/// Degrade accuracy one level per attempt, then fall back to the last fix
pub fn degrade_accuracy(attempt: u32) -> Option<RecoverySignal> {
    match attempt {
        1 => Some(RecoverySignal::AdjustLocationSettings {
            accuracy: LocationAccuracy::Balanced,
        }),
        2 => Some(RecoverySignal::AdjustLocationSettings {
            accuracy: LocationAccuracy::LowPower,
        }),
        3 => Some(RecoverySignal::UseLastKnownLocation),
        _ => None,
    }
}

/// Ask for a services check on the first two attempts
pub fn check_services(attempt: u32) -> Option<RecoverySignal> {
    (attempt <= 2).then_some(RecoverySignal::CheckLocationServices)
}

pub fn register(registry: &RecoveryRegistry) {
    register_stepped(
        registry,
        ErrorKind::LocationTimeout,
        "degrade_location_accuracy",
        degrade_accuracy,
    );
    register_stepped(
        registry,
        ErrorKind::LocationAccuracyInsufficient,
        "degrade_location_accuracy",
        degrade_accuracy,
    );
    register_stepped(
        registry,
        ErrorKind::LocationUnavailable,
        "check_location_services",
        check_services,
    );
    register_notify_only(
        registry,
        ErrorKind::LocationServicesDisabled,
        "request_location_services",
        RecoverySignal::CheckLocationServices,
    );
}
