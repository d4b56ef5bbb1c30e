//! Entry point for front ends: submit batches, control them, and read their
//! state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, info_span, warn};

use crate::broadcast::{BatchEvent, BatchEventKind};
use crate::db::{batch_repo, now_timestamp, row_job_repo};
use crate::engine::{DetectorOutcome, Engine};
use crate::error::{BatchError, IngestError, Result};
use crate::ingest;
use crate::model::{ArtifactKind, Batch, BatchSummary, DownloadStatus, RowData, RowJob, RowStatus};
use crate::sanitize;
use crate::worker::{Dispatcher, RowTask};

/// Batches shown by [`BatchService::list`] when no limit is given.
pub const DEFAULT_LIST_LIMIT: u32 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedBatch {
    pub batch_id: String,
    pub total_rows: u32,
    /// Input records dropped for having the wrong number of fields.
    pub skipped_records: usize,
}

/// What [`BatchService::recover`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Recovery {
    /// Paused rows moved back to pending.
    pub resumed: usize,
    /// Rows taken back from `processing`.
    pub reclaimed: usize,
    /// Rows dispatched, each once.
    pub dispatched: usize,
}

/// A ready artifact resolved to a local file.
#[derive(Debug, Clone, Serialize)]
pub struct Download {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub filename: String,
    pub content_type: String,
}

pub struct BatchService {
    engine: Engine,
    dispatcher: Arc<dyn Dispatcher>,
}

impl BatchService {
    pub fn new(engine: Engine, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { engine, dispatcher }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Parses a CSV file and submits one row job per data record.
    pub fn submit_csv(&self, path: &Path) -> Result<SubmittedBatch> {
        let _span = info_span!("submit_csv", file = %sanitize::redact_path(path)).entered();

        let parsed = ingest::parse_csv_file(path)?;
        if parsed.skipped > 0 {
            warn!(skipped = parsed.skipped, "Some input records were skipped");
        }
        let original_filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.csv");

        let mut submitted = self.submit_rows(original_filename, parsed.rows)?;
        submitted.skipped_records = parsed.skipped;
        Ok(submitted)
    }

    /// Creates a batch from row payloads and dispatches every row.
    pub fn submit_rows(&self, original_filename: &str, rows: Vec<RowData>) -> Result<SubmittedBatch> {
        if rows.is_empty() {
            return Err(IngestError::Empty.into());
        }

        let now = now_timestamp();
        let batch = Batch::new(original_filename, rows.len() as u32, &now);
        let jobs: Vec<RowJob> = rows
            .into_iter()
            .enumerate()
            .map(|(idx, data)| RowJob::new(&batch.id, idx as u32, data, &now))
            .collect();

        row_job_repo::insert_batch(&self.engine.db, &batch, &jobs)?;
        info!(batch_id = %batch.id, rows = jobs.len(), "Batch created");

        for job in &jobs {
            self.dispatcher.dispatch(RowTask::new(job.id.as_str()))?;
        }

        Ok(SubmittedBatch {
            batch_id: batch.id,
            total_rows: batch.total_rows,
            skipped_records: 0,
        })
    }

    /// Returns how many pending rows were parked.
    pub fn pause(&self, batch_id: &str) -> Result<usize> {
        Ok(self.engine.control.pause(batch_id)?.len())
    }

    pub fn resume(&self, batch_id: &str) -> Result<usize> {
        self.engine.control.resume(batch_id, self.dispatcher.as_ref())
    }

    /// Picks a batch back up after the process that ran it went away.
    ///
    /// Clears the pause flag, takes back rows left `processing` and moves
    /// paused rows to `pending`, then dispatches every pending row exactly
    /// once. A packaging claim that was never finished is released. With
    /// nothing to dispatch the completion check runs instead. Only call this
    /// when no other process is working on the batch.
    pub fn recover(&self, batch_id: &str) -> Result<Recovery> {
        let _span = info_span!("recover_batch", batch_id).entered();

        self.engine.pause.clear(batch_id);
        let recovered = self.engine.db.with_batch_lock(batch_id, |conn, locked| {
            let Some(locked) = locked else {
                return Ok(None);
            };
            if locked.batch.download_status == DownloadStatus::CreatingDownload {
                batch_repo::set_download_status(conn, batch_id, DownloadStatus::Pending)?;
            }
            let reclaimed = row_job_repo::set_status_where(
                conn,
                batch_id,
                RowStatus::Processing,
                RowStatus::Pending,
            )?;
            let resumed =
                row_job_repo::set_status_where(conn, batch_id, RowStatus::Paused, RowStatus::Pending)?;
            let pending: Vec<String> = locked
                .rows
                .into_iter()
                .filter(|row| {
                    matches!(
                        row.status,
                        RowStatus::Pending | RowStatus::Processing | RowStatus::Paused
                    )
                })
                .map(|row| row.id)
                .collect();
            Ok(Some((pending, reclaimed.len(), resumed.len())))
        })?;
        let Some((pending, reclaimed, resumed)) = recovered else {
            return Err(BatchError::NotFound(batch_id.to_string()).into());
        };

        for id in &pending {
            self.dispatcher.dispatch(RowTask::new(id.as_str()))?;
        }
        let recovery = Recovery {
            resumed,
            reclaimed,
            dispatched: pending.len(),
        };
        info!(
            resumed,
            reclaimed,
            dispatched = recovery.dispatched,
            "Batch recovered"
        );
        if resumed > 0 {
            self.engine.events.emit(
                batch_id,
                BatchEventKind::BatchResumed {
                    resumed_rows: resumed,
                },
            );
        }

        if pending.is_empty() {
            self.recheck(batch_id)?;
        }
        Ok(recovery)
    }

    /// Deletes one row and its files, then re-checks the batch.
    pub fn delete_row(&self, row_job_id: &str) -> Result<usize> {
        self.engine.control.delete_row(row_job_id)
    }

    pub fn force_remove(&self, batch_id: &str) -> Result<usize> {
        self.engine.control.force_remove(batch_id)
    }

    pub fn delete(&self, batch_id: &str) -> Result<usize> {
        self.engine.control.delete(batch_id)
    }

    /// Runs the completion check again, e.g. to retry failed packaging.
    pub fn recheck(&self, batch_id: &str) -> Result<DetectorOutcome> {
        self.engine.detector.check(batch_id)
    }

    pub fn summary(&self, batch_id: &str) -> Result<BatchSummary> {
        let summary = self.engine.db.with_conn(|conn| {
            let Some(batch) = batch_repo::select(conn, batch_id)? else {
                return Ok(None);
            };
            let counts = batch_repo::counts(conn, batch_id)?;
            Ok(Some(BatchSummary::new(batch, counts)))
        })?;
        summary.ok_or_else(|| BatchError::NotFound(batch_id.to_string()).into())
    }

    /// Most recent batches first.
    pub fn list(&self, limit: u32) -> Result<Vec<BatchSummary>> {
        let batches = batch_repo::list_recent(&self.engine.db, limit)?;
        let mut summaries = Vec::with_capacity(batches.len());
        for batch in batches {
            let counts = self
                .engine
                .db
                .with_conn(|conn| batch_repo::counts(conn, &batch.id))?;
            summaries.push(BatchSummary::new(batch, counts));
        }
        Ok(summaries)
    }

    pub fn rows(&self, batch_id: &str) -> Result<Vec<RowJob>> {
        Ok(row_job_repo::list_by_batch(&self.engine.db, batch_id)?)
    }

    /// Resolves the batch's ready artifact, or `DownloadNotReady` when there
    /// is none or its file is gone.
    pub fn resolve_download(&self, batch_id: &str) -> Result<Download> {
        let summary = self.summary(batch_id)?;
        let not_ready = || BatchError::DownloadNotReady(batch_id.to_string());

        if !summary.download_available() {
            return Err(not_ready().into());
        }
        let artifact = summary.batch.artifact().ok_or_else(not_ready)?;
        if !self.engine.store.exists(&artifact.path) {
            warn!(batch_id, path = %artifact.path, "Artifact file is missing");
            return Err(not_ready().into());
        }

        let path = self.engine.store.local_path(&artifact.path)?;
        let filename = artifact
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&artifact.path)
            .to_string();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();

        Ok(Download {
            path,
            kind: artifact.kind,
            filename,
            content_type,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.engine.events.subscribe()
    }
}
