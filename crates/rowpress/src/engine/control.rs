//! Batch control: pause, resume, force-remove, policy-checked delete and
//! single-row delete.

use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use super::detector::CompletionDetector;
use super::packager::batch_output_dir;
use super::pause::PauseFlags;
use crate::broadcast::{BatchEventBroadcaster, BatchEventKind};
use crate::db::{batch_repo, row_job_repo, Database};
use crate::error::{BatchError, Result};
use crate::model::{BatchState, DownloadStatus, RowStatus};
use crate::storage::{self, BlobStore};
use crate::worker::{Dispatcher, RowTask};

#[derive(Clone)]
pub struct BatchControl {
    db: Database,
    store: Arc<dyn BlobStore>,
    pause: PauseFlags,
    detector: CompletionDetector,
    events: BatchEventBroadcaster,
}

impl BatchControl {
    pub fn new(
        db: Database,
        store: Arc<dyn BlobStore>,
        pause: PauseFlags,
        detector: CompletionDetector,
        events: BatchEventBroadcaster,
    ) -> Self {
        Self {
            db,
            store,
            pause,
            detector,
            events,
        }
    }

    /// Stops new work on a batch. Pending rows are parked right away; rows
    /// already rendering finish their current attempt and are parked on
    /// their next delivery. Returns the IDs of the rows parked now.
    pub fn pause(&self, batch_id: &str) -> Result<Vec<String>> {
        let _span = info_span!("pause_batch", batch_id).entered();

        if batch_repo::find(&self.db, batch_id)?.is_none() {
            return Err(BatchError::NotFound(batch_id.to_string()).into());
        }

        let already_paused = self.pause.is_paused(batch_id);
        // Flag first so rows starting from here on see it.
        self.pause.set(batch_id);
        let parked = self.db.with_transaction(|conn| {
            row_job_repo::set_status_where(conn, batch_id, RowStatus::Pending, RowStatus::Paused)
        })?;

        info!(paused_rows = parked.len(), already_paused, "Batch paused");
        self.events.emit(
            batch_id,
            BatchEventKind::BatchPaused {
                paused_rows: parked.len(),
            },
        );
        Ok(parked)
    }

    /// Clears the pause flag, moves every paused row back to pending and
    /// dispatches each one again. Returns how many rows were resumed.
    pub fn resume(&self, batch_id: &str, dispatcher: &dyn Dispatcher) -> Result<usize> {
        let _span = info_span!("resume_batch", batch_id).entered();

        if batch_repo::find(&self.db, batch_id)?.is_none() {
            return Err(BatchError::NotFound(batch_id.to_string()).into());
        }

        self.pause.clear(batch_id);
        let resumed = self.db.with_transaction(|conn| {
            row_job_repo::set_status_where(conn, batch_id, RowStatus::Paused, RowStatus::Pending)
        })?;

        for id in &resumed {
            dispatcher.dispatch(RowTask::new(id.as_str()))?;
        }

        info!(resumed_rows = resumed.len(), "Batch resumed");
        self.events.emit(
            batch_id,
            BatchEventKind::BatchResumed {
                resumed_rows: resumed.len(),
            },
        );
        Ok(resumed.len())
    }

    /// Deletes every row of the batch and their files, whatever their state.
    /// A batch that does not exist is a no-op. Returns how many files were
    /// deleted.
    ///
    /// A render still running for a removed row may write its output after
    /// this returns; the row processor deletes that file once it finds the
    /// row gone.
    pub fn force_remove(&self, batch_id: &str) -> Result<usize> {
        let _span = info_span!("force_remove_batch", batch_id).entered();

        let paths = self
            .db
            .with_transaction(|conn| batch_repo::delete(conn, batch_id))?;
        self.pause.clear(batch_id);

        let Some(paths) = paths else {
            self.prune_output_dir(batch_id);
            info!("Batch already removed");
            return Ok(0);
        };

        let deleted = storage::delete_all(self.store.as_ref(), &paths);
        self.prune_output_dir(batch_id);

        warn!(deleted_files = deleted, "Batch force-removed");
        self.events.emit(
            batch_id,
            BatchEventKind::BatchRemoved {
                deleted_files: deleted,
            },
        );
        Ok(deleted)
    }

    /// Ordinary deletion: only batches whose rows are all finished and that
    /// are not being packaged right now. Returns how many files were deleted.
    pub fn delete(&self, batch_id: &str) -> Result<usize> {
        let _span = info_span!("delete_batch", batch_id).entered();

        let paths = self.db.with_batch_lock(batch_id, |conn, locked| {
            let Some(locked) = locked else {
                return Ok(Err(BatchError::NotFound(batch_id.to_string())));
            };
            let counts = locked.counts();
            let packaging = locked.batch.download_status == DownloadStatus::CreatingDownload;
            if !counts.is_terminal() || packaging {
                let state = if packaging {
                    BatchState::Processing
                } else {
                    BatchState::derive(&counts, locked.batch.download_status)
                };
                return Ok(Err(BatchError::NotDeletable {
                    batch_id: batch_id.to_string(),
                    state,
                }));
            }
            Ok(Ok(batch_repo::delete(conn, batch_id)?.unwrap_or_default()))
        })??;

        let deleted = storage::delete_all(self.store.as_ref(), &paths);
        self.prune_output_dir(batch_id);

        info!(deleted_files = deleted, "Batch deleted");
        self.events.emit(
            batch_id,
            BatchEventKind::BatchRemoved {
                deleted_files: deleted,
            },
        );
        Ok(deleted)
    }

    /// Deletes one row and its files. The batch shrinks by that row and is
    /// checked for completion again, since the row may have been the last
    /// one outstanding. Refused once packaging has started or finished.
    /// Returns how many files were deleted.
    pub fn delete_row(&self, row_job_id: &str) -> Result<usize> {
        let _span = info_span!("delete_row", row_job_id).entered();

        let not_found = || BatchError::RowNotFound(row_job_id.to_string());
        let Some(job) = row_job_repo::find_by_id(&self.db, row_job_id)? else {
            return Err(not_found().into());
        };
        let batch_id = job.batch_id;

        let removed = self.db.with_batch_lock(&batch_id, |conn, locked| {
            let Some(locked) = locked else {
                return Ok(Err(not_found()));
            };
            if locked.batch.packaging_claimed() {
                return Ok(Err(BatchError::RowNotDeletable {
                    row_job_id: row_job_id.to_string(),
                    batch_id: batch_id.clone(),
                    download_status: locked.batch.download_status,
                }));
            }
            let Some(row) = row_job_repo::delete(conn, row_job_id)? else {
                return Ok(Err(not_found()));
            };
            let remaining = batch_repo::sync_total_rows(conn, &batch_id)?;
            Ok(Ok((row, remaining)))
        })??;
        let (row, remaining) = removed;

        let deleted = storage::delete_all(self.store.as_ref(), &row.output_paths);
        let row_dir = format!("{}/{}", batch_output_dir(&batch_id), row.row_index);
        if let Err(e) = self.store.delete_dir(&row_dir) {
            warn!(error = %e, "Failed to prune row output directory");
        }

        info!(
            batch_id = %batch_id,
            row_index = row.row_index,
            remaining_rows = remaining,
            deleted_files = deleted,
            "Row deleted"
        );
        self.events.emit(
            &batch_id,
            BatchEventKind::RowRemoved {
                row_job_id: row.id,
                row_index: row.row_index,
                deleted_files: deleted,
            },
        );

        match self.detector.check(&batch_id) {
            Ok(outcome) => debug!(?outcome, "Completion check finished"),
            Err(e) => warn!(error = %e, "Completion check failed"),
        }
        Ok(deleted)
    }

    fn prune_output_dir(&self, batch_id: &str) {
        if let Err(e) = self.store.delete_dir(&batch_output_dir(batch_id)) {
            warn!(error = %e, "Failed to prune batch output directory");
        }
    }
}
