//! Backoff Integration Tests
//!
//! Attempt counts and wait schedules for the recorder and finalisation
//! strategies. Runs on a paused clock so waits complete instantly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use covorch::core::{
    EventStoreError, EventStoreRecorderBackoffStrategy, Readiness, ReadyToFinaliseBackoffStrategy,
};

fn out_of_order() -> anyhow::Error {
    anyhow::Error::new(EventStoreError::OutOfOrderEvent {
        event_key: "github:owner:repo:main:abc123:job:job-1".to_string(),
        version: 2,
    })
}

#[tokio::test(start_paused = true)]
async fn test_recorder_out_of_order_fails_fast() {
    let strategy = EventStoreRecorderBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(out_of_order()) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(EventStoreError::is_out_of_order_error(&result.unwrap_err()));
}

#[tokio::test(start_paused = true)]
async fn test_recorder_retries_then_succeeds() {
    let strategy = EventStoreRecorderBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(anyhow::anyhow!("throttled"))
                } else {
                    Ok(true)
                }
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(result.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_recorder_false_result_is_retried_until_exhausted() {
    let strategy = EventStoreRecorderBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!result.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_recorder_surfaces_last_error_after_exhaustion() {
    let strategy = EventStoreRecorderBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(anyhow::anyhow!("throttled on attempt {}", attempt)) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.unwrap_err().to_string(), "throttled on attempt 3");
}

#[tokio::test(start_paused = true)]
async fn test_finalise_exhaustion_returns_not_ready() {
    let strategy = ReadyToFinaliseBackoffStrategy::default();
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let result = strategy
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Readiness::NotReady) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(result.unwrap(), Readiness::NotReady);

    // 400 + 900 + 1600 + 2500
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(5400));
    assert!(waited < Duration::from_millis(5500));
}

#[tokio::test(start_paused = true)]
async fn test_finalise_stops_once_ready() {
    let strategy = ReadyToFinaliseBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok(if attempt == 3 {
                    Readiness::Ready
                } else {
                    Readiness::NotReady
                })
            }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.unwrap(), Readiness::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_finalise_errors_are_not_retried() {
    let strategy = ReadyToFinaliseBackoffStrategy::default();
    let calls = AtomicU32::new(0);

    let result = strategy
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("store unavailable")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(result.is_err());
}
