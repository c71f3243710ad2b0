/// End-to-end scenarios through the composed service
///
/// Covers the retry executor, circuit breaker lifecycle, dispatcher
/// recovery and the deferred retry queue, all under a paused clock.

mod common;

use common::{drain, flaky, names, service};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use waypoint_resilience::error::{backoff_delay, CircuitState, ErrorKind};
use waypoint_resilience::{
    ErrorContext, ErrorRecord, Resilience, ResilienceConfig, ResilienceEvent, RetryOptions,
};

// ==================== RETRY EXECUTOR ====================

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds() {
    let resilience = service(10);
    let calls = Arc::new(AtomicU32::new(0));

    let value = resilience
        .with_retry(
            flaky(2, ErrorRecord::network("reset by peer"), Arc::clone(&calls)),
            resilience.retry_options().with_max_retries(2),
            "svcX",
        )
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Absorbed failures never reach the dispatcher
    assert!(resilience.dispatcher().history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_runs_once() {
    let resilience = service(10);
    let calls = Arc::new(AtomicU32::new(0));

    let error = resilience
        .with_retry(
            flaky(u32::MAX, ErrorRecord::permission_denied("location"), Arc::clone(&calls)),
            RetryOptions::new(1),
            "svcX",
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::PermissionDenied);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Surfaced exactly once
    assert_eq!(resilience.dispatcher().history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_exact() {
    let resilience = service(10);
    let calls = Arc::new(AtomicU32::new(0));
    let options = RetryOptions::new(2)
        .with_delays(Duration::from_millis(100), Duration::from_secs(5))
        .with_backoff_factor(2.0);

    let started = tokio::time::Instant::now();
    resilience
        .with_retry(
            flaky(2, ErrorRecord::network("offline"), Arc::clone(&calls)),
            options,
            "timed",
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // 100ms + 200ms
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(310), "{:?}", elapsed);

    let d = Duration::from_millis(100);
    let m = Duration::from_secs(2);
    let expected = [100, 300, 900, 2_000, 2_000];
    for (n, millis) in expected.iter().enumerate() {
        assert_eq!(backoff_delay(d, 3.0, m, n as u32), Duration::from_millis(*millis));
    }
}

// ==================== CIRCUIT BREAKER ====================

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_lifecycle() {
    let resilience = service(3);
    let mut rx = resilience.subscribe();
    let key = "tiles";

    for _ in 0..3 {
        let result = resilience
            .with_retry(
                || async { Err::<(), _>(ErrorRecord::network("offline")) },
                RetryOptions::new(0),
                key,
            )
            .await;
        assert!(result.is_err());
    }
    assert_eq!(resilience.circuit_status(key).state, CircuitState::Open);

    // Open: fails fast without invoking the operation
    let calls = Arc::new(AtomicU32::new(0));
    let error = resilience
        .with_retry(
            flaky(0, ErrorRecord::network("unused"), Arc::clone(&calls)),
            RetryOptions::new(0),
            key,
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::ServiceUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;

    // The probe observes HalfOpen
    let breaker = Arc::clone(resilience.circuit_breaker());
    for _ in 0..2 {
        let observed = resilience
            .with_retry(
                || {
                    let state = breaker.status(key).state;
                    async move { Ok::<_, ErrorRecord>(state) }
                },
                RetryOptions::new(0),
                key,
            )
            .await
            .unwrap();
        assert_eq!(observed, CircuitState::HalfOpen);
    }

    let status = resilience.circuit_status(key);
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);

    let events = names(&drain(&mut rx));
    assert!(events.contains(&"circuitOpen"));
    assert!(events.contains(&"circuitHalfOpen"));
    assert!(events.contains(&"circuitClosed"));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let resilience = service(1);
    let failing = || async { Err::<(), _>(ErrorRecord::network("offline")) };

    let _ = resilience.with_retry(failing, RetryOptions::new(0), "geo").await;
    assert_eq!(resilience.circuit_status("geo").state, CircuitState::Open);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let _ = resilience.with_retry(failing, RetryOptions::new(0), "geo").await;

    assert_eq!(resilience.circuit_status("geo").state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opening_mid_retry_surfaces_last_failure() {
    let resilience = service(2);
    let calls = Arc::new(AtomicU32::new(0));

    let error = resilience
        .with_retry(
            flaky(u32::MAX, ErrorRecord::network("offline"), Arc::clone(&calls)),
            resilience.retry_options().with_max_retries(5),
            "sync",
        )
        .await
        .unwrap_err();

    // The breaker stops the loop after two attempts
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(resilience.circuit_status("sync").state, CircuitState::Open);
    assert_eq!(error.kind, ErrorKind::NetworkUnavailable);

    let history = resilience.dispatcher().history();
    assert_eq!(history.len(), 1);
    let metadata = &history[0].record.context.metadata;
    assert_eq!(history[0].record.kind, ErrorKind::NetworkUnavailable);
    assert_eq!(metadata["final_attempt"], true);
    assert_eq!(metadata["attempts"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_circuits_are_per_key() {
    let resilience = service(1);
    let _ = resilience
        .with_retry(
            || async { Err::<(), _>(ErrorRecord::network("offline")) },
            RetryOptions::new(0),
            "a",
        )
        .await;

    assert_eq!(resilience.circuit_status("a").state, CircuitState::Open);
    assert_eq!(resilience.circuit_status("b").state, CircuitState::Closed);
    assert_eq!(resilience.circuit_breaker().circuits().len(), 1);
}

// ==================== DISPATCHER ====================

#[tokio::test]
async fn test_dispatch_network_error_is_recovered() {
    let resilience = Resilience::default();
    let mut rx = resilience.subscribe();

    let report = resilience
        .dispatch(
            ErrorRecord::network("connection refused"),
            Some(ErrorContext::for_operation("upload")),
        )
        .await;

    assert!(report.recovered);
    assert!(!report.handled);
    assert_eq!(report.record.context.operation, "upload");

    let events = drain(&mut rx);
    assert!(!names(&events).contains(&"unhandledError"));
    assert!(events.iter().any(|event| matches!(
        event,
        ResilienceEvent::RecoverySuccess { kind: ErrorKind::NetworkUnavailable, strategy }
            if strategy == "check_connectivity"
    )));
}

#[tokio::test]
async fn test_history_keeps_most_recent_in_order() {
    let config = ResilienceConfig {
        history_capacity: 3,
        ..ResilienceConfig::default()
    };
    let resilience = Resilience::new(config).unwrap();

    for i in 0..5 {
        resilience
            .dispatch(
                ErrorRecord::new(ErrorKind::ConfigurationInvalid, format!("error {}", i)),
                None,
            )
            .await;
    }

    let messages: Vec<String> = resilience
        .dispatcher()
        .history()
        .into_iter()
        .map(|report| report.record.message)
        .collect();
    assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
}

#[tokio::test]
async fn test_opaque_failure_is_classified_by_keywords() {
    let resilience = Resilience::default();
    let report = resilience
        .dispatch("database is locked", Some(ErrorContext::for_operation("save_point")))
        .await;

    assert_eq!(report.record.kind, ErrorKind::StorageQueryFailed);
    assert!(report.recovered);
}

// ==================== DEFERRED RETRY QUEUE ====================

#[tokio::test(start_paused = true)]
async fn test_queue_for_retry_job1() {
    let resilience = service(10);
    let mut rx = resilience.subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    resilience.queue_for_retry(
        "job1",
        flaky(1, ErrorRecord::network("offline"), Arc::clone(&calls)),
        resilience.retry_options().with_max_retries(1),
    );
    assert_eq!(resilience.queue().len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(resilience.queue().len(), 0);
    assert!(drain(&mut rx).iter().any(|event| matches!(
        event,
        ResilienceEvent::RetrySuccess { id, attempts: 2 } if id == "job1"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_job_never_runs() {
    let resilience = service(10);
    let calls = Arc::new(AtomicU32::new(0));

    resilience.queue_for_retry(
        "job2",
        flaky(0, ErrorRecord::network("unused"), Arc::clone(&calls)),
        RetryOptions::new(1),
    );
    assert!(resilience.cancel_retry("job2"));
    assert!(!resilience.cancel_retry("job2"));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
