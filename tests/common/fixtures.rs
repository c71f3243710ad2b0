use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use waypoint_resilience::{ErrorRecord, Resilience, ResilienceConfig, ResilienceEvent};

/// Service with the given breaker threshold and millisecond-scale delays
pub fn service(failure_threshold: u32) -> Resilience {
    let mut config = ResilienceConfig::default();
    config.circuit_breaker.failure_threshold = failure_threshold;
    config.circuit_breaker.reset_timeout = Duration::from_secs(10);
    config.circuit_breaker.half_open_requests = 2;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(100);
    Resilience::new(config).expect("test configuration is valid")
}

/// Drain every event currently buffered for `rx`
pub fn drain(rx: &mut broadcast::Receiver<ResilienceEvent>) -> Vec<ResilienceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[ResilienceEvent]) -> Vec<&'static str> {
    events.iter().map(ResilienceEvent::name).collect()
}

/// Operation failing with `error` for the first `failures` calls, then
/// returning the 1-based call number
pub fn flaky(
    failures: u32,
    error: ErrorRecord,
    calls: Arc<AtomicU32>,
) -> impl Fn() -> futures::future::Ready<Result<u32, ErrorRecord>> + Clone + Send + Sync + 'static {
    move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(if call < failures {
            Err(error.clone())
        } else {
            Ok(call + 1)
        })
    }
}
