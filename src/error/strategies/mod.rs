/// Built-in recovery strategies
///
/// Every built-in strategy is a pure function of the attempt number that
/// picks a `RecoverySignal` to emit. Returning a signal means "remediation
/// requested, worth retrying"; returning nothing gives up.
pub mod location;
pub mod network;
pub mod platform;
pub mod storage;

use super::classification::ErrorKind;
use super::recovery::RecoveryRegistry;
use crate::events::RecoverySignal;

/// Chooses the signal for a 1-based attempt number
pub type StepFn = fn(u32) -> Option<RecoverySignal>;

/// Register every built-in strategy
pub fn register_builtin(registry: &RecoveryRegistry) {
    location::register(registry);
    storage::register(registry);
    network::register(registry);
    platform::register(registry);
}

/// Register a strategy that emits the step's signal and reports success,
/// or gives up once the step function returns `None`
pub(crate) fn register_stepped(
    registry: &RecoveryRegistry,
    kind: ErrorKind,
    name: &'static str,
    step: StepFn,
) {
    let events = registry.events().clone();
    registry.register_strategy(kind, name, move |ctx| {
        let signal = step(ctx.attempts);
        let events = events.clone();
        async move {
            match signal {
                Some(signal) => {
                    events.signal(signal);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    });
}

/// Register a strategy that only notifies; the user has to act
pub(crate) fn register_notify_only(
    registry: &RecoveryRegistry,
    kind: ErrorKind,
    name: &'static str,
    signal: RecoverySignal,
) {
    let events = registry.events().clone();
    registry.register_strategy(kind, name, move |_| {
        events.signal(signal.clone());
        async { Ok(false) }
    });
}
