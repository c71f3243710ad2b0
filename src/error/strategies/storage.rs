/// Storage and key recovery
///
/// Data-integrity failures get a single reset/regenerate request rather than
/// a retry loop.
use super::{register_stepped, StepFn};
use crate::error::classification::ErrorKind;
use crate::error::recovery::RecoveryRegistry;
use crate::events::RecoverySignal;

pub fn reset_corrupted(attempt: u32) -> Option<RecoverySignal> {
    (attempt == 1).then_some(RecoverySignal::DatabaseReset)
}

pub fn reinitialize(attempt: u32) -> Option<RecoverySignal> {
    (attempt <= 2).then_some(RecoverySignal::ReinitializeStorage)
}

/// Reopen first; if that did not help, reset
pub fn recover_init(attempt: u32) -> Option<RecoverySignal> {
    match attempt {
        1 => Some(RecoverySignal::ReinitializeStorage),
        2 => Some(RecoverySignal::DatabaseReset),
        _ => None,
    }
}

pub fn regenerate_key(attempt: u32) -> Option<RecoverySignal> {
    (attempt == 1).then_some(RecoverySignal::RegenerateKey)
}

pub fn register(registry: &RecoveryRegistry) {
    let steps: [(ErrorKind, &'static str, StepFn); 4] = [
        (ErrorKind::StorageCorrupted, "reset_database", reset_corrupted),
        (ErrorKind::StorageQueryFailed, "reinitialize_storage", reinitialize),
        (ErrorKind::StorageInitFailed, "reopen_or_reset_storage", recover_init),
        (ErrorKind::KeyMissing, "regenerate_key", regenerate_key),
    ];
    for (kind, name, step) in steps {
        register_stepped(registry, kind, name, step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_resets_once() {
        assert_eq!(reset_corrupted(1), Some(RecoverySignal::DatabaseReset));
        assert_eq!(reset_corrupted(2), None);
    }

    #[test]
    fn test_init_escalates_to_reset() {
        assert_eq!(recover_init(1), Some(RecoverySignal::ReinitializeStorage));
        assert_eq!(recover_init(2), Some(RecoverySignal::DatabaseReset));
        assert_eq!(recover_init(3), None);
    }

    #[test]
    fn test_key_regenerated_once() {
        assert_eq!(regenerate_key(1), Some(RecoverySignal::RegenerateKey));
        assert_eq!(regenerate_key(2), None);
    }
}
