//! Batch control and the service surface: pause, resume, removal, recovery,
//! submission and listing.

mod common;

use rowpress::broadcast::BatchEventKind;
use rowpress::db::{batch_repo, row_job_repo};
use rowpress::engine::ProcessOutcome;
use rowpress::storage::BlobStore;
use rowpress::{
    ArtifactKind, BatchError, BatchState, DetectorOutcome, DownloadStatus, IngestError, RowStatus, RowTask,
    RowpressError,
};

use common::*;

/// Marks row `row_index` as picked up by a worker without finishing it.
fn start_row(engine: &TestEngine, batch_id: &str, row_index: u32) -> String {
    let id = engine.row(batch_id, row_index).id;
    assert!(row_job_repo::mark_started(&engine.engine.db, &id).unwrap());
    id
}

#[test]
fn test_pause_parks_pending_rows_and_leaves_processing_row() {
    let engine = TestEngine::new();
    let mut events = engine.service.subscribe();
    let batch_id = engine.submit(ok_rows(3));
    let processing = start_row(&engine, &batch_id, 2);

    let parked = engine.service.pause(&batch_id).unwrap();
    assert_eq!(parked, 2);

    assert_eq!(engine.row(&batch_id, 0).status, RowStatus::Paused);
    assert_eq!(engine.row(&batch_id, 1).status, RowStatus::Paused);
    assert_eq!(engine.row(&batch_id, 2).status, RowStatus::Processing);
    assert!(engine.engine.pause.is_paused(&batch_id));
    assert_eq!(engine.summary(&batch_id).state, BatchState::Processing);

    // The processing row is parked on its next delivery.
    let outcome = engine.deliver(&RowTask::new(processing.as_str()));
    assert_eq!(outcome, ProcessOutcome::Paused);
    assert_eq!(engine.row(&batch_id, 2).status, RowStatus::Paused);
    assert_eq!(engine.summary(&batch_id).state, BatchState::Paused);
    assert_eq!(engine.renderer.calls(), 0);

    assert!(drain_events(&mut events, &batch_id)
        .contains(&BatchEventKind::BatchPaused { paused_rows: 2 }));
}

#[test]
fn test_queued_tasks_of_paused_batch_do_not_render() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(2));

    engine.service.pause(&batch_id).unwrap();
    let outcomes = engine.run_queued();

    assert_eq!(
        outcomes,
        vec![
            ProcessOutcome::Skipped(RowStatus::Paused),
            ProcessOutcome::Skipped(RowStatus::Paused)
        ]
    );
    assert_eq!(engine.renderer.calls(), 0);
}

#[test]
fn test_resume_requeues_paused_rows_and_completes() {
    let engine = TestEngine::new();
    let mut events = engine.service.subscribe();
    let batch_id = engine.submit(ok_rows(3));
    engine.dispatcher.take_all();

    engine.service.pause(&batch_id).unwrap();
    let resumed = engine.service.resume(&batch_id).unwrap();
    assert_eq!(resumed, 3);
    assert!(!engine.engine.pause.is_paused(&batch_id));
    assert_eq!(engine.dispatcher.queued(), 3);
    for row in engine.rows(&batch_id) {
        assert_eq!(row.status, RowStatus::Pending);
    }

    engine.run_queued();
    let summary = engine.summary(&batch_id);
    assert_eq!(summary.state, BatchState::Completed);
    assert_eq!(summary.batch.download_status, DownloadStatus::Ready);

    assert!(drain_events(&mut events, &batch_id)
        .contains(&BatchEventKind::BatchResumed { resumed_rows: 3 }));
}

#[test]
fn test_pause_and_resume_unknown_batch_is_not_found() {
    let engine = TestEngine::new();
    assert!(matches!(
        engine.service.pause("nope"),
        Err(RowpressError::Batch(BatchError::NotFound(_)))
    ));
    assert!(matches!(
        engine.service.resume("nope"),
        Err(RowpressError::Batch(BatchError::NotFound(_)))
    ));
    assert!(!engine.engine.pause.is_paused("nope"));
}

#[test]
fn test_force_remove_deletes_rows_and_files_in_any_state() {
    let engine = TestEngine::with_max_attempts(1);
    let batch_id = engine.submit(vec![
        ok_row("DONE"),
        scripted_row("BAD", "fail"),
        ok_row("BUSY"),
        ok_row("WAIT"),
        ok_row("PARK"),
    ]);
    let tasks = engine.dispatcher.take_all();
    engine.deliver(&tasks[0]);
    engine.deliver(&tasks[1]);
    let busy = start_row(&engine, &batch_id, 2);
    let parked = engine.row(&batch_id, 4).id;
    assert!(row_job_repo::update_status(
        &engine.engine.db,
        &parked,
        &[RowStatus::Pending],
        RowStatus::Paused
    )
    .unwrap());

    let done_output = engine.row(&batch_id, 0).output_paths[0].clone();
    assert!(engine.store.exists(&done_output));

    let deleted = engine.service.force_remove(&batch_id).unwrap();
    assert_eq!(deleted, 1);
    assert!(!engine.store.exists(&done_output));
    assert!(engine.files_under("pdfs").is_empty());
    assert!(engine.rows(&batch_id).is_empty());
    assert!(matches!(
        engine.service.summary(&batch_id),
        Err(RowpressError::Batch(BatchError::NotFound(_)))
    ));

    // A late delivery for a removed row is a no-op.
    assert_eq!(
        engine.deliver(&RowTask::new(busy.as_str())),
        ProcessOutcome::Missing
    );

    // Removing again is safe.
    assert_eq!(engine.service.force_remove(&batch_id).unwrap(), 0);
}

#[test]
fn test_force_remove_deletes_archive() {
    let engine = TestEngine::new();
    let batch_id = engine.run_batch(ok_rows(2));
    let artifact = engine.summary(&batch_id).batch.artifact().unwrap();
    assert!(engine.store.exists(&artifact.path));

    let deleted = engine.service.force_remove(&batch_id).unwrap();
    assert_eq!(deleted, 1);
    assert!(!engine.store.exists(&artifact.path));
    assert!(engine.files_under("").is_empty());
}

#[test]
fn test_force_remove_clears_pause_flag() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(1));
    engine.service.pause(&batch_id).unwrap();

    engine.service.force_remove(&batch_id).unwrap();
    assert!(!engine.engine.pause.is_paused(&batch_id));
}

#[test]
fn test_delete_refuses_unfinished_batch() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(2));

    match engine.service.delete(&batch_id) {
        Err(RowpressError::Batch(BatchError::NotDeletable { batch_id: id, state })) => {
            assert_eq!(id, batch_id);
            assert_eq!(state, BatchState::Pending);
        }
        other => panic!("expected NotDeletable, got {:?}", other),
    }
    assert_eq!(engine.rows(&batch_id).len(), 2);
}

#[test]
fn test_delete_refuses_batch_being_packaged() {
    let engine = TestEngine::with_max_attempts(1);
    let batch_id = engine.run_batch(vec![scripted_row("X", "fail")]);
    engine
        .engine
        .db
        .with_conn(|conn| {
            batch_repo::set_download_status(conn, &batch_id, DownloadStatus::CreatingDownload)
        })
        .unwrap();

    assert!(matches!(
        engine.service.delete(&batch_id),
        Err(RowpressError::Batch(BatchError::NotDeletable { .. }))
    ));
}

#[test]
fn test_delete_finished_batch_removes_everything() {
    let engine = TestEngine::new();
    let mut events = engine.service.subscribe();
    let batch_id = engine.run_batch(ok_rows(1));
    let artifact = engine.summary(&batch_id).batch.artifact().unwrap();

    let deleted = engine.service.delete(&batch_id).unwrap();
    assert_eq!(deleted, 1);
    assert!(!engine.store.exists(&artifact.path));
    assert!(engine.files_under("").is_empty());
    assert!(engine.rows(&batch_id).is_empty());
    assert!(drain_events(&mut events, &batch_id)
        .contains(&BatchEventKind::BatchRemoved { deleted_files: 1 }));

    assert!(matches!(
        engine.service.delete(&batch_id),
        Err(RowpressError::Batch(BatchError::NotFound(_)))
    ));
}

#[test]
fn test_recover_redispatches_stale_rows_and_releases_claim() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(3));
    engine.dispatcher.take_all();

    // Simulate a process that died mid-row and mid-packaging.
    start_row(&engine, &batch_id, 1);
    engine
        .engine
        .db
        .with_conn(|conn| {
            batch_repo::set_download_status(conn, &batch_id, DownloadStatus::CreatingDownload)
        })
        .unwrap();

    let recovery = engine.service.recover(&batch_id).unwrap();
    assert_eq!(recovery.reclaimed, 1);
    assert_eq!(recovery.resumed, 0);
    assert_eq!(recovery.dispatched, 3);
    assert_eq!(engine.row(&batch_id, 1).status, RowStatus::Pending);
    assert_eq!(
        engine.summary(&batch_id).batch.download_status,
        DownloadStatus::Pending
    );

    engine.run_queued();
    let summary = engine.summary(&batch_id);
    assert_eq!(summary.state, BatchState::Completed);
    assert_eq!(summary.batch.download_status, DownloadStatus::Ready);
    assert_eq!(engine.row(&batch_id, 1).attempts, 2);
}

#[test]
fn test_recover_of_paused_batch_dispatches_each_row_once() {
    let engine = TestEngine::new();
    let mut events = engine.service.subscribe();
    let batch_id = engine.submit(vec![
        ok_row("A"),
        ok_row("B"),
        scripted_row("FLAKY", "flaky"),
    ]);
    engine.dispatcher.take_all();
    start_row(&engine, &batch_id, 0);
    assert_eq!(engine.service.pause(&batch_id).unwrap(), 2);

    let recovery = engine.service.recover(&batch_id).unwrap();
    assert_eq!(recovery.resumed, 2);
    assert_eq!(recovery.reclaimed, 1);
    assert_eq!(recovery.dispatched, 3);
    assert_eq!(engine.dispatcher.queued(), 3);
    assert!(!engine.engine.pause.is_paused(&batch_id));

    engine.run_queued();
    let summary = engine.summary(&batch_id);
    assert_eq!(summary.state, BatchState::Completed);
    assert_eq!(engine.row(&batch_id, 0).attempts, 2);
    assert_eq!(engine.row(&batch_id, 1).attempts, 1);
    // First attempt fails, the retry succeeds: no attempt is lost.
    assert_eq!(engine.row(&batch_id, 2).attempts, 2);
    assert_eq!(engine.renderer.calls(), 4);

    assert!(drain_events(&mut events, &batch_id)
        .contains(&BatchEventKind::BatchResumed { resumed_rows: 2 }));
}

#[test]
fn test_delete_row_removes_files_and_shrinks_batch() {
    let engine = TestEngine::new();
    let mut events = engine.service.subscribe();
    let batch_id = engine.submit(ok_rows(3));
    let tasks = engine.dispatcher.take_all();
    assert_eq!(engine.deliver(&tasks[0]), ProcessOutcome::Completed);
    let done = engine.row(&batch_id, 0);
    let output = done.output_paths[0].clone();
    assert!(engine.store.exists(&output));

    assert_eq!(engine.service.delete_row(&done.id).unwrap(), 1);

    assert!(!engine.store.exists(&output));
    let summary = engine.summary(&batch_id);
    assert_eq!(summary.batch.total_rows, 2);
    assert_eq!(summary.counts.total, 2);
    assert!(drain_events(&mut events, &batch_id).contains(&BatchEventKind::RowRemoved {
        row_job_id: done.id.clone(),
        row_index: 0,
        deleted_files: 1,
    }));

    assert!(matches!(
        engine.service.delete_row(&done.id),
        Err(RowpressError::Batch(BatchError::RowNotFound(_)))
    ));
    assert_eq!(engine.deliver(&tasks[0]), ProcessOutcome::Missing);
}

#[test]
fn test_delete_last_outstanding_row_packages_batch() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(3));
    let tasks = engine.dispatcher.take_all();
    engine.deliver(&tasks[0]);
    engine.deliver(&tasks[1]);
    assert_eq!(
        engine.summary(&batch_id).batch.download_status,
        DownloadStatus::Pending
    );

    assert_eq!(engine.service.delete_row(&tasks[2].row_job_id).unwrap(), 0);

    let summary = engine.summary(&batch_id);
    assert_eq!(summary.state, BatchState::Completed);
    assert_eq!(summary.batch.download_status, DownloadStatus::Ready);
    assert_eq!(summary.batch.artifact_kind, Some(ArtifactKind::Archive));
    assert_eq!(engine.deliver(&tasks[2]), ProcessOutcome::Missing);
}

#[test]
fn test_delete_row_refused_once_packaged() {
    let engine = TestEngine::new();
    let batch_id = engine.run_batch(ok_rows(1));
    let row = engine.row(&batch_id, 0);
    let artifact = engine.summary(&batch_id).batch.artifact().unwrap();

    assert!(matches!(
        engine.service.delete_row(&row.id),
        Err(RowpressError::Batch(BatchError::RowNotDeletable { .. }))
    ));
    assert!(engine.store.exists(&artifact.path));
    assert_eq!(engine.rows(&batch_id).len(), 1);
}

#[test]
fn test_recover_packages_batch_whose_rows_already_finished() {
    let engine = TestEngine::new();
    let batch_id = engine.submit(ok_rows(1));
    let task = engine.dispatcher.pop().unwrap();
    let id = task.row_job_id.clone();

    // The row finished but the process died before packaging.
    assert!(row_job_repo::mark_started(&engine.engine.db, &id).unwrap());
    let path = format!("pdfs/{}/0/document_R-1.pdf", batch_id);
    engine.store.put(&path, b"%PDF-1.4 done").unwrap();
    assert!(row_job_repo::mark_completed(&engine.engine.db, &id, &[path.clone()]).unwrap());

    assert_eq!(engine.service.recover(&batch_id).unwrap().dispatched, 0);
    let artifact = engine.summary(&batch_id).batch.artifact().unwrap();
    assert_eq!(artifact.path, path);
    assert_eq!(
        engine.service.recheck(&batch_id).unwrap(),
        DetectorOutcome::AlreadyHandled
    );
}

#[test]
fn test_submit_csv_skips_mismatched_records() {
    let engine = TestEngine::new();
    let csv = write_csv(
        engine.temp_path(),
        "march invoices.csv",
        "reference,name,amount\nA-1,Alice,10\nbroken,row\nA-2,Bob,20\n",
    );

    let submitted = engine.service.submit_csv(&csv).unwrap();
    assert_eq!(submitted.total_rows, 2);
    assert_eq!(submitted.skipped_records, 1);
    assert_eq!(engine.dispatcher.queued(), 2);

    let summary = engine.summary(&submitted.batch_id);
    assert_eq!(summary.batch.original_filename, "march invoices.csv");
    assert_eq!(summary.counts.pending, 2);

    let rows = engine.rows(&submitted.batch_id);
    assert_eq!(rows[1].row_data.get("name"), Some("Bob"));

    engine.run_queued();
    let artifact = engine.summary(&submitted.batch_id).batch.artifact().unwrap();
    assert!(artifact.path.starts_with("downloads/documents_march-invoices_"));
}

#[test]
fn test_submit_rejects_input_without_rows() {
    let engine = TestEngine::new();
    let csv = write_csv(engine.temp_path(), "empty.csv", "reference,name\n");

    assert!(matches!(
        engine.service.submit_csv(&csv),
        Err(RowpressError::Ingest(IngestError::Empty))
    ));
    assert!(matches!(
        engine.service.submit_rows("none.csv", Vec::new()),
        Err(RowpressError::Ingest(IngestError::Empty))
    ));
    assert_eq!(engine.dispatcher.total(), 0);
    assert!(engine.service.list(10).unwrap().is_empty());
}

#[test]
fn test_list_returns_newest_first_with_limit() {
    let engine = TestEngine::new();
    let first = engine.submit(ok_rows(1));
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = engine.submit(ok_rows(2));
    std::thread::sleep(std::time::Duration::from_millis(5));
    let third = engine.submit(ok_rows(3));

    let ids: Vec<String> = engine
        .service
        .list(10)
        .unwrap()
        .into_iter()
        .map(|s| s.batch.id)
        .collect();
    assert_eq!(ids, vec![third.clone(), second, first]);

    let limited = engine.service.list(1).unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].batch.id, third);
    assert_eq!(limited[0].counts.total, 3);
}

#[test]
fn test_summary_tracks_progress() {
    let engine = TestEngine::with_max_attempts(1);
    let batch_id = engine.submit(vec![
        ok_row("A"),
        scripted_row("B", "fail"),
        ok_row("C"),
        ok_row("D"),
    ]);
    let tasks = engine.dispatcher.take_all();
    engine.deliver(&tasks[0]);
    engine.deliver(&tasks[1]);

    let summary = engine.summary(&batch_id);
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.pending, 2);
    assert_eq!(summary.progress, 50.0);
    assert_eq!(summary.state, BatchState::Processing);
    assert!(!summary.is_settled());
    assert!(matches!(
        engine.service.resolve_download(&batch_id),
        Err(RowpressError::Batch(BatchError::DownloadNotReady(_)))
    ));
}

#[test]
fn test_resolve_download_reports_missing_artifact_file() {
    let engine = TestEngine::new();
    let batch_id = engine.run_batch(ok_rows(2));
    let artifact = engine.summary(&batch_id).batch.artifact().unwrap();
    engine.store.delete(&artifact.path).unwrap();

    assert!(matches!(
        engine.service.resolve_download(&batch_id),
        Err(RowpressError::Batch(BatchError::DownloadNotReady(_)))
    ));
}
