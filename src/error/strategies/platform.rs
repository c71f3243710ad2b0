/// Permission, tracking, geofence and background-task recovery
use super::{register_notify_only, register_stepped};
use crate::error::classification::ErrorKind;
use crate::error::recovery::RecoveryRegistry;
use crate::events::RecoverySignal;

pub fn restart_tracking(attempt: u32) -> Option<RecoverySignal> {
    (attempt == 1).then_some(RecoverySignal::RestartTracking)
}

pub fn reregister_geofences(attempt: u32) -> Option<RecoverySignal> {
    (attempt <= 2).then_some(RecoverySignal::ReregisterGeofences)
}

pub fn reschedule_task(attempt: u32) -> Option<RecoverySignal> {
    (attempt <= 3).then_some(RecoverySignal::RescheduleBackgroundTask)
}

pub fn register(registry: &RecoveryRegistry) {
    for (kind, background) in [
        (ErrorKind::PermissionDenied, false),
        (ErrorKind::PermissionBackgroundDenied, true),
        (ErrorKind::PermissionRestricted, false),
    ] {
        register_notify_only(
            registry,
            kind,
            "request_permission",
            RecoverySignal::PermissionRequired { kind, background },
        );
    }

    register_stepped(
        registry,
        ErrorKind::TrackingStartFailed,
        "restart_tracking",
        restart_tracking,
    );
    register_stepped(
        registry,
        ErrorKind::GeofenceMonitoringFailed,
        "reregister_geofences",
        reregister_geofences,
    );
    register_stepped(
        registry,
        ErrorKind::BackgroundTaskFailed,
        "reschedule_background_task",
        reschedule_task,
    );
}
