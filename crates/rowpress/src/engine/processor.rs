//! Row processor: runs one delivery of a row job through the row state
//! machine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, field, info, info_span, warn};

use super::detector::CompletionDetector;
use super::packager::batch_output_dir;
use super::pause::PauseFlags;
use crate::broadcast::{BatchEventBroadcaster, BatchEventKind};
use crate::config::OutputConfig;
use crate::db::{batch_repo, row_job_repo, Database};
use crate::error::{RenderError, Result};
use crate::model::{ArtifactKind, RowJob, RowStatus};
use crate::render::Renderer;
use crate::sanitize;
use crate::storage::BlobStore;
use crate::worker::{RetryPolicy, RowTask, TaskHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The row job no longer exists.
    Missing,
    /// The batch is paused; the row was parked as `paused`.
    Paused,
    /// The row was not in a startable state (duplicate delivery).
    Skipped(RowStatus),
    /// The attempt failed and the row went back to `pending`.
    Retry { delay: Duration },
    Completed,
    Failed,
}

pub struct RowProcessor {
    db: Database,
    store: Arc<dyn BlobStore>,
    renderer: Arc<dyn Renderer>,
    pause: PauseFlags,
    detector: CompletionDetector,
    retry: RetryPolicy,
    events: BatchEventBroadcaster,
    output: OutputConfig,
}

impl RowProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        store: Arc<dyn BlobStore>,
        renderer: Arc<dyn Renderer>,
        pause: PauseFlags,
        detector: CompletionDetector,
        retry: RetryPolicy,
        events: BatchEventBroadcaster,
        output: OutputConfig,
    ) -> Self {
        Self {
            db,
            store,
            renderer,
            pause,
            detector,
            retry,
            events,
            output,
        }
    }

    /// Storage path of a row's document. Stable across attempts so a retry
    /// overwrites whatever an earlier attempt left behind.
    pub fn output_path(&self, job: &RowJob) -> String {
        let reference = job
            .row_data
            .get(&self.output.reference_field)
            .map(sanitize::file_component)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| (job.row_index + 1).to_string());
        format!(
            "{}/{}/{}_{}.{}",
            batch_output_dir(&job.batch_id),
            job.row_index,
            self.output.filename_prefix,
            reference,
            self.renderer.extension()
        )
    }

    pub fn process(&self, task: &RowTask) -> Result<ProcessOutcome> {
        let span = info_span!("process_row",
            row_job_id = %task.row_job_id,
            delivery = task.attempt,
            batch_id = field::Empty,
            row_index = field::Empty,
            attempt = field::Empty,
        );
        let _guard = span.enter();

        let Some(job) = row_job_repo::find_by_id(&self.db, &task.row_job_id)? else {
            debug!("Row job no longer exists");
            return Ok(ProcessOutcome::Missing);
        };
        span.record("batch_id", job.batch_id.as_str());
        span.record("row_index", job.row_index);

        if !matches!(job.status, RowStatus::Pending | RowStatus::Processing) {
            debug!(status = %job.status, "Row not startable, skipping");
            return Ok(ProcessOutcome::Skipped(job.status));
        }

        if let Some(paused_since) = self.pause.paused_at(&job.batch_id) {
            let parked = row_job_repo::update_status(
                &self.db,
                &job.id,
                &[RowStatus::Pending, RowStatus::Processing],
                RowStatus::Paused,
            )?;
            if parked {
                info!(%paused_since, "Batch paused, row parked");
                return Ok(ProcessOutcome::Paused);
            }
            return self.current_state(&job.id);
        }

        // A processing row belongs to the delivery that claimed it.
        if job.status == RowStatus::Processing {
            debug!("Row claimed by another delivery, skipping");
            return Ok(ProcessOutcome::Skipped(job.status));
        }

        if !row_job_repo::mark_started(&self.db, &job.id)? {
            return self.current_state(&job.id);
        }
        let attempt = job.attempts + 1;
        span.record("attempt", attempt);

        // From here on the row is ours and must not stay processing.
        match catch_unwind(AssertUnwindSafe(|| self.run_attempt(&job, attempt))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => self.settle(&job, attempt, e.to_string()),
            Err(panic) => self.settle(
                &job,
                attempt,
                format!("row processing panicked: {}", panic_message(panic.as_ref())),
            ),
        }
    }

    fn run_attempt(&self, job: &RowJob, attempt: u32) -> Result<ProcessOutcome> {
        let path = self.output_path(job);
        if let Err(e) = self.render_and_store(job, &path) {
            let outcome = self.fail_or_retry(job, attempt, e.to_string());
            self.release_output(job, &path);
            return outcome;
        }

        match row_job_repo::mark_completed(&self.db, &job.id, std::slice::from_ref(&path)) {
            Ok(true) => {
                info!(output = %path, "Row completed");
                self.events.emit(
                    &job.batch_id,
                    BatchEventKind::RowFinished {
                        row_job_id: job.id.clone(),
                        row_index: job.row_index,
                        status: RowStatus::Completed,
                        error: None,
                    },
                );
                self.finish(&job.batch_id);
                Ok(ProcessOutcome::Completed)
            }
            Ok(false) => {
                // Removed or paused while rendering.
                self.release_output(job, &path);
                let outcome = self.current_state(&job.id)?;
                warn!(?outcome, "Row changed while rendering");
                Ok(outcome)
            }
            Err(e) => {
                let outcome =
                    self.fail_or_retry(job, attempt, format!("failed to record output: {}", e));
                self.release_output(job, &path);
                outcome
            }
        }
    }

    /// Settles a claimed row after an error or a panic escaped its attempt.
    /// The row is retried or failed like a render failure; if even that
    /// cannot be recorded, failing it is tried once more on its own.
    fn settle(&self, job: &RowJob, attempt: u32, error: String) -> Result<ProcessOutcome> {
        error!(error = %error, "Row attempt aborted");
        match row_job_repo::find_by_id(&self.db, &job.id) {
            Ok(Some(current)) if current.status == RowStatus::Processing => {}
            Ok(_) => return self.current_state(&job.id),
            Err(e) => warn!(error = %e, "Could not re-read row, settling anyway"),
        }

        match self.fail_or_retry(job, attempt, error.clone()) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let failed = row_job_repo::mark_failed(&self.db, &job.id, &error);
                self.finish(&job.batch_id);
                match failed {
                    Ok(true) => Ok(ProcessOutcome::Failed),
                    Ok(false) => self.current_state(&job.id),
                    Err(_) => Err(e),
                }
            }
        }
    }

    fn render_and_store(&self, job: &RowJob, path: &str) -> Result<()> {
        let rendered = catch_unwind(AssertUnwindSafe(|| self.renderer.render(&job.row_data)))
            .map_err(|panic| RenderError::Panicked(panic_message(panic.as_ref())))?;
        let bytes = rendered?;
        if bytes.is_empty() {
            return Err(RenderError::EmptyOutput.into());
        }
        self.store.put(path, &bytes)?;
        Ok(())
    }

    /// Requeues the row while attempts remain, otherwise fails it for good.
    fn fail_or_retry(&self, job: &RowJob, attempt: u32, error: String) -> Result<ProcessOutcome> {
        if let Some(delay) = self.retry.delay_for(attempt) {
            if row_job_repo::requeue(&self.db, &job.id, &error)? {
                warn!(error = %error, retry_in_secs = delay.as_secs_f64(), "Row attempt failed, will retry");
                return Ok(ProcessOutcome::Retry { delay });
            }
            return self.current_state(&job.id);
        }

        let marked = row_job_repo::mark_failed(&self.db, &job.id, &error);
        match &marked {
            Ok(true) => {
                error!(error = %error, "Row failed");
                self.events.emit(
                    &job.batch_id,
                    BatchEventKind::RowFinished {
                        row_job_id: job.id.clone(),
                        row_index: job.row_index,
                        status: RowStatus::Failed,
                        error: Some(error.clone()),
                    },
                );
            }
            Ok(false) => debug!("Row left processing before it could be failed"),
            Err(e) => error!(error = %e, "Failed to record row failure"),
        }

        // Runs whether or not recording the failure worked.
        self.finish(&job.batch_id);

        if marked? {
            Ok(ProcessOutcome::Failed)
        } else {
            self.current_state(&job.id)
        }
    }

    fn finish(&self, batch_id: &str) {
        match catch_unwind(AssertUnwindSafe(|| self.detector.check(batch_id))) {
            Ok(Ok(outcome)) => debug!(?outcome, "Completion check finished"),
            Ok(Err(e)) => error!(error = %e, "Completion check failed"),
            Err(panic) => error!(
                panic = %panic_message(panic.as_ref()),
                "Completion check panicked"
            ),
        }
    }

    fn current_state(&self, id: &str) -> Result<ProcessOutcome> {
        Ok(match row_job_repo::find_by_id(&self.db, id)? {
            Some(job) => ProcessOutcome::Skipped(job.status),
            None => ProcessOutcome::Missing,
        })
    }

    fn archived(&self, batch_id: &str) -> bool {
        matches!(
            batch_repo::find(&self.db, batch_id),
            Ok(Some(batch)) if batch.artifact_kind == Some(ArtifactKind::Archive)
        )
    }

    /// Deletes `path` unless the row currently references it and the file is
    /// still wanted. Once the row and its batch are gone the batch output
    /// directory goes too, so a render that outlived a force-remove leaves
    /// nothing behind.
    fn release_output(&self, job: &RowJob, path: &str) {
        let current = match row_job_repo::find_by_id(&self.db, &job.id) {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Could not re-read row, keeping output");
                return;
            }
        };
        match current {
            Some(row) if row.output_paths.iter().any(|p| p == path) => {
                // A duplicate delivery rewrote a file the archive already
                // absorbed.
                if self.archived(&job.batch_id) {
                    if let Err(e) = self.store.delete(path) {
                        warn!(path = %path, error = %e, "Failed to delete archived output");
                    }
                }
            }
            Some(_) => {
                if let Err(e) = self.store.delete(path) {
                    warn!(path = %path, error = %e, "Failed to delete partial output");
                }
            }
            None => {
                if let Err(e) = self.store.delete(path) {
                    warn!(path = %path, error = %e, "Failed to delete orphaned output");
                }
                if matches!(batch_repo::find(&self.db, &job.batch_id), Ok(None)) {
                    let _ = self.store.delete_dir(&batch_output_dir(&job.batch_id));
                }
            }
        }
    }
}

impl TaskHandler for RowProcessor {
    fn handle(&self, task: &RowTask) -> Option<Duration> {
        match self.process(task) {
            Ok(ProcessOutcome::Retry { delay }) => Some(delay),
            Ok(_) => None,
            Err(e) => {
                error!(row_job_id = %task.row_job_id, error = %e, "Row processing error");
                self.retry.delay_for(task.attempt)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
