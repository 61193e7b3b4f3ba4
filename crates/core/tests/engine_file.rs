use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use blobshift_core::{
    Connections, InMemoryDestination, InMemorySource, MigrationConfig, MigrationEngine,
    MigrationOptions, MigrationPhase, MigrationProgress, MigrationStatus,
};
use tokio_util::sync::CancellationToken;

fn engine(source: Arc<InMemorySource>, dest: Arc<InMemoryDestination>) -> MigrationEngine {
    let conns = Connections::new(dest).with_source(source);
    MigrationEngine::new(MigrationConfig::default(), conns).unwrap()
}

fn record(engine: &MigrationEngine) -> Arc<Mutex<Vec<MigrationProgress>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.on_progress(move |p| sink.lock().unwrap().push(p.clone()));
    events
}

#[tokio::test]
async fn single_file_reports_download_then_upload_then_completed() {
    let source = Arc::new(
        InMemorySource::new()
            .with_chunk_size(500)
            .with_object("docs/report.bin", vec![7u8; 1000]),
    );
    let dest = Arc::new(InMemoryDestination::new());
    let engine = engine(source, dest.clone());
    engine.initialize().await.unwrap();
    let events = record(&engine);

    let result = engine.migrate_file("docs/report.bin").await;
    assert!(result.success, "{result:?}");
    assert!(!result.cid.as_deref().unwrap_or_default().is_empty());
    assert!(!result.url.as_deref().unwrap_or_default().is_empty());
    assert_eq!(result.size, Some(1000));
    assert!(result.error.is_none());

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0].status, MigrationStatus::Preparing);
    let rest = &events[1..];
    assert_eq!(rest.len(), 4);

    assert_eq!(rest[0].phase, MigrationPhase::Download);
    assert_eq!(rest[0].downloaded_bytes, 500);
    assert_eq!(rest[0].total_download_bytes, 1000);
    assert_eq!(rest[0].phase_percentage, 50.0);
    // Upload bytes mirror the download, so each phase weighs half.
    assert_eq!(rest[0].total_upload_bytes, 1000);
    assert_eq!(rest[0].percentage, 25.0);

    assert_eq!(rest[1].phase, MigrationPhase::Download);
    assert_eq!(rest[1].downloaded_bytes, 1000);
    assert_eq!(rest[1].phase_percentage, 100.0);
    assert_eq!(rest[1].percentage, 50.0);

    assert_eq!(rest[2].phase, MigrationPhase::Upload);
    assert_eq!(rest[2].uploaded_bytes, 1000);
    assert_eq!(rest[2].phase_percentage, 100.0);
    assert_eq!(rest[2].percentage, 100.0);

    assert_eq!(rest[3].status, MigrationStatus::Completed);
    assert_eq!(rest[3].percentage, 100.0);
    assert_eq!(rest[3].remaining_files, 0);
    assert_eq!(rest[3].completed_files, 1);
    assert_eq!(rest[3].estimated_time_remaining, "Complete");
    assert!(rest[3].end_time > 0);

    for pair in events.windows(2) {
        assert!(pair[1].percentage >= pair[0].percentage);
    }
    assert_eq!(dest.uploads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn flaky_fetch_is_retried() {
    let source = Arc::new(InMemorySource::new().with_object("a.txt", b"hello".to_vec()));
    source.fail_fetch("a.txt", 2);
    let dest = Arc::new(InMemoryDestination::new());
    let engine = engine(source.clone(), dest);
    engine.initialize().await.unwrap();

    let result = engine.migrate_file("a.txt").await;
    assert!(result.success, "{result:?}");
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 3);
    assert_eq!(engine.progress().failed_files, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_upload_becomes_failed_result() {
    let source = Arc::new(InMemorySource::new().with_object("a.txt", b"hello".to_vec()));
    let dest = Arc::new(InMemoryDestination::new());
    dest.fail_uploads(u32::MAX);
    let engine = engine(source, dest.clone());
    engine.initialize().await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    engine.on_error(move |err, file| {
        sink.lock()
            .unwrap()
            .push((err.to_string(), file.map(str::to_string)))
    });

    let result = engine.migrate_file("a.txt").await;
    assert!(!result.success);
    assert!(result.cid.is_none());
    let message = result.error.unwrap();
    assert!(message.contains("migrate file a.txt"), "{message}");
    assert!(message.contains("3 attempts"), "{message}");
    assert_eq!(dest.upload_calls.load(Ordering::Relaxed), 3);

    let snapshot = engine.progress();
    assert_eq!(snapshot.status, MigrationStatus::Error);
    assert_eq!(snapshot.failed_files, 1);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].file, "a.txt");

    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1.as_deref(), Some("a.txt"));
}

#[tokio::test]
async fn migrating_before_initialize_fails_without_counting_a_unit() {
    let source = Arc::new(InMemorySource::new().with_object("a.txt", b"x".to_vec()));
    let engine = engine(source.clone(), Arc::new(InMemoryDestination::new()));

    let result = engine.migrate_file("a.txt").await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("not initialized"));
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 0);

    let snapshot = engine.progress();
    assert_eq!(snapshot.status, MigrationStatus::Error);
    assert_eq!(snapshot.failed_files, 0);
}

#[tokio::test]
async fn cancelled_token_stops_before_any_transfer() {
    let source = Arc::new(InMemorySource::new().with_object("a.txt", b"x".to_vec()));
    let dest = Arc::new(InMemoryDestination::new());
    let engine = engine(source.clone(), dest.clone());
    engine.initialize().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .migrate_file_with(
            "a.txt",
            MigrationOptions {
                cancel: Some(&cancel),
            },
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert_eq!(source.fetch_calls.load(Ordering::Relaxed), 0);
    assert_eq!(dest.upload_calls.load(Ordering::Relaxed), 0);
    assert_eq!(engine.progress().status, MigrationStatus::Error);
}

#[tokio::test]
async fn next_migration_starts_from_a_fresh_snapshot() {
    let source = Arc::new(
        InMemorySource::new()
            .with_object("a.txt", b"aaaa".to_vec())
            .with_object("b.txt", b"bb".to_vec()),
    );
    let engine = engine(source, Arc::new(InMemoryDestination::new()));
    engine.initialize().await.unwrap();

    assert!(engine.migrate_file("a.txt").await.success);
    let events = record(&engine);
    assert!(engine.migrate_file("b.txt").await.success);

    let events = events.lock().unwrap().clone();
    assert_eq!(events[0].percentage, 0.0);
    assert_eq!(events[0].completed_files, 0);
    let last = events.last().unwrap();
    assert_eq!(last.total_download_bytes, 2);
    assert_eq!(last.completed_files, 1);
}

#[tokio::test(start_paused = true)]
async fn close_releases_adapters_after_a_failed_migration() {
    let source = Arc::new(InMemorySource::new());
    let dest = Arc::new(InMemoryDestination::new());
    let engine = engine(source, dest.clone());
    engine.initialize().await.unwrap();

    let result = engine.migrate_file("missing").await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("object not found: missing"));

    engine.close().await.unwrap();
    engine.close().await.unwrap();
    assert!(dest.closed.load(Ordering::Relaxed));
}
