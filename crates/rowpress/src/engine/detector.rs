//! Batch completion detection.
//!
//! Every row processor calls [`CompletionDetector::check`] after its row
//! reaches a terminal state, so many calls for one batch race each other.
//! The terminal check and the packaging claim happen under the batch write
//! lock; whoever claims first moves the batch to `creating_download` and
//! every later caller sees the guard and backs off.

use std::sync::Arc;

use tracing::{debug, info};

use super::packager::Packager;
use crate::broadcast::{BatchEventBroadcaster, BatchEventKind};
use crate::db::{batch_repo, Database};
use crate::error::{PackagingError, Result};
use crate::model::{Artifact, Batch, DownloadStatus, StatusCounts};

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    /// The batch no longer exists.
    Missing,
    /// Some rows are still pending, processing or paused.
    NotTerminal(StatusCounts),
    /// Packaging already ran or is running.
    AlreadyHandled,
    /// Every row failed: the batch is finished without a download.
    NothingToPackage(StatusCounts),
    Packaged(Artifact),
}

enum Claim {
    Done(DetectorOutcome),
    Package {
        batch: Batch,
        paths: Vec<String>,
        counts: StatusCounts,
    },
}

#[derive(Clone)]
pub struct CompletionDetector {
    db: Database,
    packager: Arc<Packager>,
    events: BatchEventBroadcaster,
}

impl CompletionDetector {
    pub fn new(db: Database, packager: Arc<Packager>, events: BatchEventBroadcaster) -> Self {
        Self {
            db,
            packager,
            events,
        }
    }

    /// Packages the batch if it is terminal and nobody has claimed it yet.
    ///
    /// Safe to call any number of times, concurrently. A batch whose previous
    /// packaging attempt failed is packaged again.
    pub fn check(&self, batch_id: &str) -> Result<DetectorOutcome> {
        let claim = self.db.with_batch_lock(batch_id, |conn, locked| {
            let Some(locked) = locked else {
                return Ok(Claim::Done(DetectorOutcome::Missing));
            };

            let counts = locked.counts();
            if !counts.is_terminal() {
                return Ok(Claim::Done(DetectorOutcome::NotTerminal(counts)));
            }
            if locked.batch.packaging_claimed() {
                return Ok(Claim::Done(DetectorOutcome::AlreadyHandled));
            }

            let paths = locked.output_paths();
            if paths.is_empty() {
                return Ok(Claim::Done(DetectorOutcome::NothingToPackage(counts)));
            }

            batch_repo::set_download_status(conn, batch_id, DownloadStatus::CreatingDownload)?;
            Ok(Claim::Package {
                batch: locked.batch,
                paths,
                counts,
            })
        })?;

        let (batch, paths, counts) = match claim {
            Claim::Done(outcome) => {
                if let DetectorOutcome::NothingToPackage(counts) = &outcome {
                    info!(batch_id, failed = counts.failed, "Batch finished without outputs");
                    self.emit_completed(batch_id, counts);
                } else {
                    debug!(batch_id, ?outcome, "Completion check");
                }
                return Ok(outcome);
            }
            Claim::Package {
                batch,
                paths,
                counts,
            } => (batch, paths, counts),
        };

        info!(
            batch_id,
            completed = counts.completed + counts.download_failed,
            failed = counts.failed,
            "Batch finished, packaging outputs"
        );
        self.emit_completed(batch_id, &counts);

        match self.packager.package(&batch, &paths) {
            Ok(artifact) => Ok(DetectorOutcome::Packaged(artifact)),
            Err(PackagingError::BatchRemoved(_)) => Ok(DetectorOutcome::Missing),
            Err(e) => Err(e.into()),
        }
    }

    fn emit_completed(&self, batch_id: &str, counts: &StatusCounts) {
        self.events.emit(
            batch_id,
            BatchEventKind::BatchCompleted {
                completed: counts.completed + counts.download_failed,
                failed: counts.failed,
            },
        );
    }
}
