//! Self-driven sessions: one generation call per section, strictly in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use grantflow::catalog::SectionCatalog;
use grantflow::error::{OrchestratorError, SectionGenerationError, SequencingViolation};
use grantflow::executor::SectionExecutor;
use grantflow::orchestrator::GenerationOrchestrator;
use grantflow::progress::ProgressEvent;
use grantflow::session::{OverallStatus, SectionStatus};

use crate::integration::support::{answer, results_for, small_catalog, ScriptedGenerator};

#[tokio::test]
async fn full_catalog_completes_in_order_and_reports_once() {
    let generator = ScriptedGenerator::new();
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator.clone()));

    let completed_sections = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&completed_sections);
    orchestrator.on_section_completed(move |done| {
        sink.lock().push((done.key.to_string(), done.accumulated.len()));
        Ok(())
    });
    let finals = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finals);
    orchestrator.on_completed(move |results| sink.lock().push(results));

    let catalog = SectionCatalog::grant_application();
    let keys: Vec<String> = catalog.keys().map(String::from).collect();
    let snapshot = orchestrator
        .start(catalog, json!({"organisation": "Acme"}))
        .await
        .unwrap();

    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(generator.called_keys(), keys);
    // Each call carried every earlier result.
    let previous: Vec<usize> = generator.calls.lock().iter().map(|(_, n)| *n).collect();
    assert_eq!(previous, vec![0, 1, 2, 3, 4, 5]);

    let completed = completed_sections.lock().clone();
    assert_eq!(completed.len(), 6);
    assert!(completed.iter().enumerate().all(|(i, (_, n))| *n == i + 1));

    let finals = finals.lock();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].keys().cloned().collect::<Vec<_>>(), keys);
    assert_eq!(orchestrator.overall_percent(), 100.0);
    assert!(orchestrator.estimated_time_remaining().is_none());
}

#[tokio::test]
async fn failure_halts_and_retry_resumes_without_touching_earlier_sections() {
    let generator = ScriptedGenerator::new().fail("impact", SectionGenerationError::RateLimited);
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator.clone()));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    orchestrator.on_failed(move |failure| sink.lock().push((failure.key.clone(), failure.message())));
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    orchestrator.on_completed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let snapshot = orchestrator
        .start(SectionCatalog::grant_application(), json!({}))
        .await
        .unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Failed);
    assert_eq!(snapshot.status_of("impact"), Some(SectionStatus::Failed));
    assert_eq!(
        snapshot.section("impact").and_then(|s| s.error.clone()).as_deref(),
        Some("rate limited")
    );
    assert_eq!(snapshot.status_of("partnership"), Some(SectionStatus::Pending));
    assert_eq!(snapshot.status_of("budget"), Some(SectionStatus::Pending));
    assert_eq!(
        *failures.lock(),
        vec![("impact".to_string(), "rate limited".to_string())]
    );
    assert_eq!(orchestrator.results().len(), 3);
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    let earlier: Vec<_> = snapshot.sections[..3].to_vec();
    let snapshot = orchestrator.retry_section("impact").await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(snapshot.sections[..3].to_vec(), earlier);
    assert_eq!(snapshot.section("impact").unwrap().error, None);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(
        generator.called_keys(),
        vec![
            "project_summary",
            "relevance",
            "methodology",
            "impact",
            "impact",
            "partnership",
            "budget"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn section_timeout_is_reported_as_failure() {
    let generator = ScriptedGenerator::new().delay("b", Duration::from_secs(600));
    let catalog = small_catalog();
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator));

    let snapshot = orchestrator.start(catalog, json!({})).await.unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Failed);
    let error = snapshot.section("b").and_then(|s| s.error.clone()).unwrap();
    assert!(error.contains("timed out"), "unexpected error: {error}");
    assert_eq!(snapshot.status_of("a"), Some(SectionStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn cancel_freezes_state_and_drops_late_result() {
    let generator = ScriptedGenerator::new().delay("b", Duration::from_secs(10));
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator.clone()));
    let saved = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&saved);
    orchestrator.on_section_completed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let running = orchestrator.clone();
    let task = tokio::spawn(async move { running.start(small_catalog(), json!({})).await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let before = orchestrator.snapshot().unwrap();
    assert_eq!(before.overall_status, OverallStatus::InProgress);
    assert_eq!(before.status_of("a"), Some(SectionStatus::Completed));
    assert_eq!(before.status_of("b"), Some(SectionStatus::InProgress));

    orchestrator.cancel().unwrap();
    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Cancelled);

    // Let the in-flight call finish; its result must not land.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let after = orchestrator.snapshot().unwrap();
    assert_eq!(after.overall_status, OverallStatus::Cancelled);
    assert_eq!(after.status_of("b"), before.status_of("b"));
    assert_eq!(after.status_of("c"), Some(SectionStatus::Pending));
    assert_eq!(orchestrator.results().len(), 1);
    assert_eq!(saved.load(Ordering::SeqCst), 1);
    assert_eq!(generator.called_keys(), vec!["a", "b"]);

    assert_eq!(orchestrator.cancel(), Err(SequencingViolation::Cancelled));
    assert!(matches!(
        orchestrator.retry_section("b").await,
        Err(OrchestratorError::Sequencing(SequencingViolation::Cancelled))
    ));
}

#[tokio::test(start_paused = true)]
async fn second_start_while_running_is_rejected() {
    let generator = ScriptedGenerator::new().delay("a", Duration::from_secs(5));
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator));

    let running = orchestrator.clone();
    let task = tokio::spawn(async move { running.start(small_catalog(), json!({})).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    let id = orchestrator.snapshot().unwrap().id;

    assert!(matches!(
        orchestrator.start(small_catalog(), json!({})).await,
        Err(OrchestratorError::Sequencing(SequencingViolation::AlreadyRunning))
    ));
    assert!(matches!(
        orchestrator.retry_section("c").await,
        Err(OrchestratorError::Sequencing(SequencingViolation::NotFailed(_)))
    ));

    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.id, id);
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn progress_events_are_rejected_for_self_driven_sessions() {
    let generator = ScriptedGenerator::new().delay("a", Duration::from_secs(1));
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(generator.clone()));

    let running = orchestrator.clone();
    let task = tokio::spawn(async move { running.start(small_catalog(), json!({})).await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut event = ProgressEvent::in_progress(Some("b"), &["a"]);
    event.results = results_for(&["a"]);
    assert!(matches!(
        orchestrator.handle_event(event).await,
        Err(OrchestratorError::Sequencing(SequencingViolation::EventsNotAccepted))
    ));
    let snapshot = orchestrator.snapshot().unwrap();
    assert_eq!(snapshot.status_of("a"), Some(SectionStatus::InProgress));
    assert_eq!(snapshot.status_of("b"), Some(SectionStatus::Pending));

    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(snapshot.overall_status, OverallStatus::Completed);
    assert_eq!(generator.called_keys(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn restart_after_completion_opens_a_fresh_session() {
    let orchestrator = GenerationOrchestrator::self_driven(SectionExecutor::new(ScriptedGenerator::new()));
    let first = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    let second = orchestrator.start(small_catalog(), json!({})).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.overall_status, OverallStatus::Completed);
    assert_eq!(orchestrator.results()["c"], answer("c"));
}
