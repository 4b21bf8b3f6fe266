//! Server-managed sessions: progress over a stream, polling fallback, retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use grantflow::catalog::SectionCatalog;
use grantflow::error::{OrchestratorError, SequencingViolation, TransportError};
use grantflow::orchestrator::{Driver, GenerationOrchestrator, OrchestratorSettings};
use grantflow::progress::ProgressEvent;
use grantflow::session::{OverallStatus, SectionStatus, TransportMode};

use crate::integration::support::{
    answer, results_for, small_catalog, ScriptedBackend, StreamScript, REMOTE_ID,
};

fn orchestrator(backend: &Arc<ScriptedBackend>, stall: Duration) -> GenerationOrchestrator {
    GenerationOrchestrator::new(
        Driver::ServerManaged(backend.clone()),
        OrchestratorSettings {
            poll_interval: Duration::from_millis(500),
            stall_timeout: stall,
            ..OrchestratorSettings::default()
        },
    )
}

fn completed(keys: &[&str]) -> ProgressEvent {
    ProgressEvent::in_progress(None, keys).with_status(OverallStatus::Completed)
}

#[tokio::test]
async fn stream_drives_full_catalog_to_completion() {
    let catalog = SectionCatalog::grant_application();
    let keys: Vec<&str> = catalog.keys().collect();
    let mut events = Vec::new();
    for i in 0..keys.len() {
        let percent = (i as f64) * 100.0 / keys.len() as f64;
        events.push(Ok(ProgressEvent::in_progress(Some(keys[i]), &keys[..i]).with_percent(percent)));
    }
    events.push(Ok(completed(&keys).with_percent(100.0)));

    let backend = ScriptedBackend::new().stream(StreamScript::closing(events));
    let orchestrator = orchestrator(&backend, Duration::from_secs(30));
    let finals = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finals);
    orchestrator.on_completed(move |results| sink.lock().push(results.len()));

    let snapshot = orchestrator.start(catalog.clone(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.id, REMOTE_ID);
    assert_eq!(snapshot.transport_mode, TransportMode::Streaming);
    assert_eq!(*finals.lock(), vec![6]);
    assert_eq!(*backend.fetched.lock(), keys);
    assert_eq!(*backend.opens.lock(), 1);
    assert_eq!(orchestrator.overall_percent(), 100.0);
    assert_eq!(orchestrator.results()["budget"], answer("budget"));
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_fails_over_to_polling_once() {
    let backend = ScriptedBackend::new()
        .stream(StreamScript::hanging(vec![Ok(ProgressEvent::in_progress(Some("a"), &[]))]))
        .poll(Ok(ProgressEvent::in_progress(Some("b"), &["a"]).with_percent(40.0)))
        .poll(Ok(completed(&["a", "b", "c"])));
    let orchestrator = orchestrator(&backend, Duration::from_secs(1));

    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.transport_mode, TransportMode::Polling);
    assert_eq!(*backend.opens.lock(), 1);
    assert_eq!(*backend.poll_count.lock(), 2);
    assert_eq!(*backend.fetched.lock(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn default_settings_fail_over_after_one_quiet_poll_interval() {
    let mut second = ProgressEvent::in_progress(Some("b"), &["a"]);
    second.results = results_for(&["a"]);
    let mut third = ProgressEvent::in_progress(Some("c"), &["a", "b"]);
    third.results = results_for(&["b"]);
    let mut done = completed(&["a", "b", "c"]);
    done.results = results_for(&["c"]);
    let backend = ScriptedBackend::new()
        .stream(StreamScript::hanging(vec![
            Ok(ProgressEvent::in_progress(Some("a"), &[])),
            Ok(second),
        ]))
        .poll(Ok(third))
        .poll(Ok(done));
    let orchestrator = GenerationOrchestrator::new(
        Driver::ServerManaged(backend.clone()),
        OrchestratorSettings::default(),
    );

    let began = tokio::time::Instant::now();
    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(10));
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.transport_mode, TransportMode::Polling);
    assert_eq!(*backend.opens.lock(), 1);
    assert_eq!(*backend.poll_count.lock(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_stream_errors_fail_over_only_once() {
    let mut done = completed(&["a", "b", "c"]);
    done.results = results_for(&["a", "b", "c"]);
    let backend = ScriptedBackend::new()
        .stream_error(TransportError::Connect("stream refused".to_string()))
        .stream(StreamScript::closing(vec![Err(TransportError::StreamClosed)]))
        .poll(Ok(ProgressEvent::in_progress(Some("b"), &["a"]).with_percent(30.0)))
        .poll(Ok(done));
    let orchestrator = orchestrator(&backend, Duration::from_secs(1));

    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.transport_mode, TransportMode::Polling);
    assert!(snapshot.transport_error.is_none());
    assert_eq!(*backend.opens.lock(), 1);
    assert_eq!(*backend.poll_count.lock(), 2);
}

#[tokio::test(start_paused = true)]
async fn polling_failure_leaves_session_running_with_visible_error() {
    let backend = ScriptedBackend::new()
        .stream_error(TransportError::Connect("stream refused".to_string()))
        .poll(Err(TransportError::Connect("poll refused".to_string())));
    let orchestrator = orchestrator(&backend, Duration::from_secs(30));

    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::InProgress);
    assert_eq!(snapshot.transport_mode, TransportMode::Polling);
    assert_eq!(
        snapshot.transport_error.as_deref(),
        Some("Connection error: poll refused")
    );
    assert_eq!(*backend.opens.lock(), 1);
    assert_eq!(*backend.poll_count.lock(), 1);

    assert!(matches!(
        orchestrator.start(small_catalog(), json!({})).await,
        Err(OrchestratorError::Sequencing(SequencingViolation::AlreadyRunning))
    ));

    orchestrator.cancel().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*backend.cancelled.lock(), vec![REMOTE_ID]);
    assert_eq!(orchestrator.status(), OverallStatus::Cancelled);
}

#[tokio::test]
async fn failed_section_is_retried_through_the_backend() {
    let mut failed = ProgressEvent::in_progress(Some("b"), &["a"])
        .with_status(OverallStatus::Failed)
        .with_error("rate limited");
    failed.results = results_for(&["a"]);
    let mut resumed = ProgressEvent::in_progress(Some("c"), &["a", "b"]);
    resumed.results = results_for(&["b"]);
    let mut done = completed(&["a", "b", "c"]);
    done.results = results_for(&["c"]);

    let backend = ScriptedBackend::new()
        .stream(StreamScript::closing(vec![
            Ok(ProgressEvent::in_progress(Some("a"), &[])),
            Ok(failed),
        ]))
        .stream(StreamScript::closing(vec![Ok(resumed), Ok(done)]));
    let orchestrator = orchestrator(&backend, Duration::from_secs(30));
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    orchestrator.on_failed(move |failure| {
        assert_eq!(failure.key, "b");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Failed);
    assert_eq!(snapshot.status_of("a"), Some(SectionStatus::Completed));
    assert_eq!(
        snapshot.section("b").and_then(|s| s.error.clone()).as_deref(),
        Some("rate limited")
    );
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    let before = snapshot.section("a").cloned();
    let snapshot = orchestrator.retry_section("b").await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.section("a").cloned(), before);
    assert_eq!(*backend.retried.lock(), vec!["b"]);
    assert_eq!(*backend.opens.lock(), 2);
    assert!(backend.fetched.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_events_are_discarded() {
    let mut first = ProgressEvent::in_progress(Some("b"), &["a"]).with_percent(40.0);
    first.results = results_for(&["a"]);
    let backend = ScriptedBackend::new().stream(StreamScript::hanging(vec![Ok(first)]));
    let orchestrator = orchestrator(&backend, Duration::from_secs(60));

    assert!(matches!(
        orchestrator.handle_event(ProgressEvent::in_progress(None, &[])).await,
        Err(OrchestratorError::Sequencing(SequencingViolation::NoActiveSession))
    ));

    let running = orchestrator.clone();
    let task = tokio::spawn(async move { running.start(small_catalog(), json!({})).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        orchestrator.snapshot().unwrap().status_of("a"),
        Some(SectionStatus::Completed)
    );
    assert_eq!(orchestrator.overall_percent(), 40.0);

    orchestrator
        .handle_event(ProgressEvent::in_progress(Some("a"), &[]).with_percent(10.0))
        .await
        .unwrap();
    let snapshot = orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.status_of("a"), Some(SectionStatus::Completed));
    assert_eq!(snapshot.status_of("b"), Some(SectionStatus::InProgress));
    assert_eq!(orchestrator.overall_percent(), 40.0);

    let mut done = completed(&["a", "b", "c"]);
    done.results = results_for(&["b", "c"]);
    orchestrator.handle_event(done).await.unwrap();
    assert_eq!(orchestrator.status(), OverallStatus::Completed);

    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert!(backend.fetched.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_following_and_notifies_backend() {
    let backend = ScriptedBackend::new()
        .stream(StreamScript::hanging(vec![Ok(ProgressEvent::in_progress(Some("a"), &[]))]));
    let orchestrator = orchestrator(&backend, Duration::from_secs(60));

    let running = orchestrator.clone();
    let task = tokio::spawn(async move { running.start(small_catalog(), json!({})).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.status(), OverallStatus::InProgress);

    orchestrator.cancel().unwrap();
    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Cancelled);
    assert_eq!(snapshot.status_of("a"), Some(SectionStatus::InProgress));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*backend.cancelled.lock(), vec![REMOTE_ID]);
    assert_eq!(orchestrator.cancel(), Err(SequencingViolation::Cancelled));
}

#[tokio::test]
async fn refused_start_returns_to_idle() {
    let mut done = completed(&["a", "b", "c"]);
    done.results = results_for(&["a", "b", "c"]);
    let backend = ScriptedBackend::new().stream(StreamScript::closing(vec![Ok(done)]));
    *backend.start_error.lock() = Some(TransportError::Status {
        status: 503,
        message: "maintenance".to_string(),
    });
    let orchestrator = orchestrator(&backend, Duration::from_secs(30));

    assert!(matches!(
        orchestrator.start(small_catalog(), json!({})).await,
        Err(OrchestratorError::SessionStart(TransportError::Status { status: 503, .. }))
    ));
    assert_eq!(orchestrator.status(), OverallStatus::Idle);

    let snapshot = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(orchestrator.results().len(), 3);
}
