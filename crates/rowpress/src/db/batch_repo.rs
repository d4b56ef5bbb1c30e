//! Batch repository: the `batches` table and batch-wide updates.
//!
//! Everything that decides on the aggregate state of a batch reads it
//! through [`lock`] inside `Database::with_batch_lock`.

use rusqlite::{params, Connection, Row};

use super::{now_timestamp, row_job_repo, Database, DatabaseError};
use crate::model::{Artifact, Batch, DownloadStatus, RowJob, RowStatus, StatusCounts};

fn from_row(row: &Row<'_>) -> Result<Batch, rusqlite::Error> {
    Ok(Batch {
        id: row.get("id")?,
        original_filename: row.get("original_filename")?,
        total_rows: row.get("total_rows")?,
        download_status: row.get("download_status")?,
        artifact_path: row.get("artifact_path")?,
        artifact_kind: row.get("artifact_kind")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// A batch and all of its rows as read under the batch lock.
#[derive(Debug, Clone)]
pub struct LockedBatch {
    pub batch: Batch,
    pub rows: Vec<RowJob>,
}

impl LockedBatch {
    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_rows(&self.rows)
    }

    /// Output paths of rows that carry outputs, in row order.
    pub fn output_paths(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|row| row.status.has_outputs())
            .flat_map(|row| row.output_paths.iter().cloned())
            .collect()
    }
}

/// Reads a batch row on an open connection.
pub fn select(conn: &Connection, id: &str) -> Result<Option<Batch>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM batches WHERE id = ?1")?;
    let mut rows = stmt.query_map(params![id], from_row)?;
    Ok(rows.next().transpose()?)
}

/// Finds a batch by its ID.
pub fn find(db: &Database, id: &str) -> Result<Option<Batch>, DatabaseError> {
    db.with_conn(|conn| select(conn, id))
}

/// Loads a batch with every one of its rows. Call inside a transaction.
pub fn lock(conn: &Connection, id: &str) -> Result<Option<LockedBatch>, DatabaseError> {
    let Some(batch) = select(conn, id)? else {
        return Ok(None);
    };
    let rows = row_job_repo::select_by_batch(conn, id)?;
    Ok(Some(LockedBatch { batch, rows }))
}

/// Counts the rows of a batch by status.
pub fn counts(conn: &Connection, id: &str) -> Result<StatusCounts, DatabaseError> {
    let mut stmt = conn.prepare("SELECT status FROM row_jobs WHERE batch_id = ?1")?;
    let statuses = stmt.query_map(params![id], |r| r.get::<_, RowStatus>(0))?;
    let mut counts = StatusCounts::default();
    for status in statuses {
        counts.add(status?);
    }
    Ok(counts)
}

pub fn set_download_status(
    conn: &Connection,
    id: &str,
    status: DownloadStatus,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE batches SET download_status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status, now_timestamp()],
    )?;
    Ok(())
}

/// Brings `total_rows` back in line with the rows the batch still has.
pub fn sync_total_rows(conn: &Connection, id: &str) -> Result<u32, DatabaseError> {
    let total: u32 = conn.query_row(
        "SELECT COUNT(*) FROM row_jobs WHERE batch_id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    conn.execute(
        "UPDATE batches SET total_rows = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, total, now_timestamp()],
    )?;
    Ok(total)
}

/// Records a packaged artifact and marks the download ready.
///
/// Rows left in `download_failed` by an earlier attempt go back to `completed`.
pub fn stamp_artifact(
    conn: &Connection,
    id: &str,
    artifact: &Artifact,
) -> Result<bool, DatabaseError> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE batches SET artifact_path = ?2, artifact_kind = ?3, download_status = ?4,
         updated_at = ?5 WHERE id = ?1",
        params![id, artifact.path, artifact.kind, DownloadStatus::Ready, now],
    )?;
    row_job_repo::set_status_where(conn, id, RowStatus::DownloadFailed, RowStatus::Completed)?;
    Ok(changed > 0)
}

/// Records a packaging failure: the download becomes `failed` and completed
/// rows become `download_failed`.
pub fn mark_download_failed(conn: &Connection, id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE batches SET download_status = ?2, artifact_path = NULL, artifact_kind = NULL,
         updated_at = ?3 WHERE id = ?1",
        params![id, DownloadStatus::Failed, now_timestamp()],
    )?;
    row_job_repo::set_status_where(conn, id, RowStatus::Completed, RowStatus::DownloadFailed)?;
    Ok(())
}

/// Most recently created batches first.
pub fn list_recent(db: &Database, limit: u32) -> Result<Vec<Batch>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM batches ORDER BY created_at DESC, id LIMIT ?1")?;
        let batches = stmt
            .query_map(params![limit], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    })
}

/// Deletes a batch and its rows. Returns every file the batch referenced
/// (row outputs and the artifact), or `None` if the batch did not exist.
pub fn delete(conn: &Connection, id: &str) -> Result<Option<Vec<String>>, DatabaseError> {
    let batch = select(conn, id)?;
    let mut paths = row_job_repo::delete_batch(conn, id)?;
    let Some(batch) = batch else {
        return Ok(if paths.is_empty() { None } else { Some(paths) });
    };
    if let Some(artifact) = batch.artifact() {
        if !paths.contains(&artifact.path) {
            paths.push(artifact.path);
        }
    }
    conn.execute("DELETE FROM batches WHERE id = ?1", params![id])?;
    log::info!("Deleted batch {} ({} files referenced)", id, paths.len());
    Ok(Some(paths))
}
