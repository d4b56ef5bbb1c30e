//! Packaging: turns the outputs of a finished batch into one download
//! artifact.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::broadcast::{BatchEventBroadcaster, BatchEventKind};
use crate::db::{batch_repo, Database};
use crate::error::{PackagingError, StorageError};
use crate::model::{Artifact, ArtifactKind, Batch};
use crate::sanitize;
use crate::storage::{self, BlobStore};

/// Directory artifacts are written to inside the store.
pub const DOWNLOADS_DIR: &str = "downloads";

/// Directory row outputs of a batch live under.
pub fn batch_output_dir(batch_id: &str) -> String {
    format!("pdfs/{}", batch_id)
}

pub struct Packager {
    db: Database,
    store: Arc<dyn BlobStore>,
    events: BatchEventBroadcaster,
    archive_prefix: String,
}

impl Packager {
    pub fn new(
        db: Database,
        store: Arc<dyn BlobStore>,
        events: BatchEventBroadcaster,
        archive_prefix: impl Into<String>,
    ) -> Self {
        Self {
            db,
            store,
            events,
            archive_prefix: archive_prefix.into(),
        }
    }

    /// Builds and records the artifact for `batch` from `paths`.
    ///
    /// The caller must already have moved the batch to `creating_download`.
    /// On failure the batch ends in `failed` download state with its completed
    /// rows marked `download_failed`, and the error is returned.
    pub fn package(&self, batch: &Batch, paths: &[String]) -> Result<Artifact, PackagingError> {
        let _span = info_span!("package",
            batch_id = %batch.id,
            outputs = paths.len(),
        )
        .entered();

        self.events.emit(&batch.id, BatchEventKind::DownloadStarted);

        match self.build_and_record(batch, paths) {
            Ok(artifact) => {
                info!(path = %artifact.path, kind = %artifact.kind, "Download ready");
                self.events.emit(
                    &batch.id,
                    BatchEventKind::DownloadReady {
                        path: artifact.path.clone(),
                        kind: artifact.kind,
                    },
                );
                Ok(artifact)
            }
            Err(PackagingError::BatchRemoved(id)) => {
                warn!("Batch was removed while packaging");
                Err(PackagingError::BatchRemoved(id))
            }
            Err(e) => {
                error!(error = %e, "Packaging failed");
                if let Err(db_err) = self
                    .db
                    .with_transaction(|conn| batch_repo::mark_download_failed(conn, &batch.id))
                {
                    error!(error = %db_err, "Failed to record packaging failure");
                }
                self.events.emit(
                    &batch.id,
                    BatchEventKind::DownloadFailed {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    fn build_and_record(&self, batch: &Batch, paths: &[String]) -> Result<Artifact, PackagingError> {
        let artifact = match paths {
            [] => return Err(PackagingError::NothingToPackage),
            [single] => {
                self.verify(single)?;
                Artifact {
                    path: single.clone(),
                    kind: ArtifactKind::Single,
                }
            }
            _ => {
                let archive_path = self.write_archive(batch, paths)?;
                if let Err(e) = self.verify(&archive_path) {
                    let _ = self.store.delete(&archive_path);
                    return Err(e);
                }
                Artifact {
                    path: archive_path,
                    kind: ArtifactKind::Archive,
                }
            }
        };

        let stamped = self
            .db
            .with_transaction(|conn| batch_repo::stamp_artifact(conn, &batch.id, &artifact));
        match stamped {
            Ok(true) => {}
            Ok(false) => {
                self.discard(&artifact);
                return Err(PackagingError::BatchRemoved(batch.id.clone()));
            }
            Err(e) => {
                self.discard(&artifact);
                return Err(e.into());
            }
        }

        if artifact.kind == ArtifactKind::Archive {
            let removed = storage::delete_all(self.store.as_ref(), paths);
            if let Err(e) = self.store.delete_dir(&batch_output_dir(&batch.id)) {
                warn!(error = %e, "Failed to prune batch output directory");
            }
            debug!(removed, "Removed archived row outputs");
        }

        Ok(artifact)
    }

    /// Only a freshly written archive is ours to delete; a single artifact is
    /// the row's own output.
    fn discard(&self, artifact: &Artifact) {
        if artifact.kind == ArtifactKind::Archive {
            let _ = self.store.delete(&artifact.path);
        }
    }

    /// The artifact must exist and be non-empty.
    fn verify(&self, path: &str) -> Result<(), PackagingError> {
        match self.store.size(path) {
            Ok(0) => Err(PackagingError::EmptyArtifact(path.to_string())),
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => Err(PackagingError::MissingOutput(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn write_archive(&self, batch: &Batch, paths: &[String]) -> Result<String, PackagingError> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut added = 0;
        for (name, path) in archive_entries(paths) {
            let content = match self.store.read(path) {
                Ok(content) => content,
                Err(StorageError::NotFound(_)) => {
                    warn!(path = %path, "Skipping missing output while archiving");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            zip.start_file(name, options)?;
            zip.write_all(&content)?;
            added += 1;
        }

        if added == 0 {
            return Err(PackagingError::MissingOutput(format!(
                "none of the {} outputs of batch {} exist",
                paths.len(),
                batch.id
            )));
        }

        let bytes = zip.finish()?.into_inner();
        let target = format!(
            "{}/{}",
            DOWNLOADS_DIR,
            archive_name(&self.archive_prefix, &batch.original_filename)
        );
        let written = self.store.put_new(&target, &bytes)?;
        debug!(path = %written, entries = added, bytes = bytes.len(), "Archive written");
        Ok(written)
    }
}

/// `<prefix>_<slug of file stem>_<timestamp>.zip`
pub fn archive_name(prefix: &str, original_filename: &str) -> String {
    let stem = Path::new(original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let mut slug = sanitize::slugify(stem);
    if slug.is_empty() {
        slug = "batch".to_string();
    }
    format!(
        "{}_{}_{}.zip",
        prefix,
        slug,
        Utc::now().format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Flattens paths to base names. A later path with the same base name
/// replaces the earlier one, keeping the earlier one's position.
fn archive_entries(paths: &[String]) -> Vec<(String, &str)> {
    let mut entries: Vec<(String, &str)> = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => {
                warn!(name = %name, "Duplicate file name in archive, keeping the later file");
                entry.1 = path;
            }
            None => entries.push((name, path)),
        }
    }
    entries
}
