//! Row job repository: CRUD and status transitions for the `row_jobs` table.
//!
//! Single-row updates go through `Database::with_conn` and are guarded by
//! `WHERE status IN (...)` so a stale writer cannot overwrite a state it did
//! not expect. Functions taking a `&Connection` are meant to run inside a
//! batch transaction.

use rusqlite::{params, params_from_iter, Connection, Row, ToSql};

use super::{now_timestamp, Database, DatabaseError};
use crate::model::{Batch, RowJob, RowStatus};

fn from_row(row: &Row<'_>) -> Result<RowJob, rusqlite::Error> {
    let row_data: String = row.get("row_data")?;
    let output_paths: Option<String> = row.get("output_paths")?;
    Ok(RowJob {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        row_index: row.get("row_index")?,
        row_data: decode_json(&row_data, "row_data")?,
        status: row.get("status")?,
        output_paths: match output_paths {
            Some(raw) => decode_json(&raw, "output_paths")?,
            None => Vec::new(),
        },
        attempts: row.get("attempts")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: &'static str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(DatabaseError::Json { column, source: e }),
        )
    })
}

fn encode_paths(paths: &[String]) -> Result<Option<String>, DatabaseError> {
    if paths.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(paths)
        .map(Some)
        .map_err(|e| DatabaseError::Json {
            column: "output_paths",
            source: e,
        })
}

fn status_placeholders(from: &[RowStatus], offset: usize) -> String {
    (0..from.len())
        .map(|i| format!("?{}", i + offset))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keeps the statuses of `from` that the row state machine lets move to `to`.
fn allowed_sources(from: &[RowStatus], to: RowStatus) -> Result<Vec<RowStatus>, DatabaseError> {
    let allowed: Vec<RowStatus> = from
        .iter()
        .copied()
        .filter(|status| status.can_transition_to(to))
        .collect();
    if allowed.is_empty() {
        return Err(DatabaseError::InvalidTransition {
            from: from.to_vec(),
            to,
        });
    }
    Ok(allowed)
}

/// Moves row `id` to `to` if its status is one of `from` and the state
/// machine allows it. `assignments` may set further columns using the
/// parameters `?4` onwards, supplied in `extra`.
fn transition(
    conn: &Connection,
    id: &str,
    from: &[RowStatus],
    to: RowStatus,
    assignments: &str,
    extra: &[&dyn ToSql],
) -> Result<bool, DatabaseError> {
    let from = allowed_sources(from, to)?;
    let sql = format!(
        "UPDATE row_jobs SET status = ?1, updated_at = ?2{} WHERE id = ?3 AND status IN ({})",
        assignments,
        status_placeholders(&from, 4 + extra.len())
    );
    let now = now_timestamp();
    let mut values: Vec<&dyn ToSql> = vec![&to, &now, &id];
    values.extend_from_slice(extra);
    values.extend(from.iter().map(|s| s as &dyn ToSql));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

/// Inserts a batch and all of its row jobs in one transaction.
pub fn insert_batch(db: &Database, batch: &Batch, rows: &[RowJob]) -> Result<(), DatabaseError> {
    db.with_transaction(|conn| {
        conn.execute(
            "INSERT INTO batches (id, original_filename, total_rows, download_status,
             artifact_path, artifact_kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                batch.id,
                batch.original_filename,
                batch.total_rows,
                batch.download_status,
                batch.artifact_path,
                batch.artifact_kind,
                batch.created_at,
                batch.updated_at,
            ],
        )?;

        let mut stmt = conn.prepare(
            "INSERT INTO row_jobs (id, batch_id, row_index, row_data, status, output_paths,
             attempts, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for job in rows {
            let row_data = serde_json::to_string(&job.row_data).map_err(|e| {
                DatabaseError::Json {
                    column: "row_data",
                    source: e,
                }
            })?;
            stmt.execute(params![
                job.id,
                job.batch_id,
                job.row_index,
                row_data,
                job.status,
                encode_paths(&job.output_paths)?,
                job.attempts,
                job.error,
                job.created_at,
                job.updated_at,
            ])?;
        }
        Ok(())
    })
}

/// Finds a row job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RowJob>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM row_jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// All row jobs of a batch ordered by row index, read on an open connection.
pub fn select_by_batch(conn: &Connection, batch_id: &str) -> Result<Vec<RowJob>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM row_jobs WHERE batch_id = ?1 ORDER BY row_index")?;
    let rows = stmt
        .query_map(params![batch_id], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All row jobs of a batch ordered by row index.
pub fn list_by_batch(db: &Database, batch_id: &str) -> Result<Vec<RowJob>, DatabaseError> {
    db.with_conn(|conn| select_by_batch(conn, batch_id))
}

/// Moves a row to `to` if it is currently in one of `from`.
/// Returns whether the row was updated.
pub fn update_status(
    db: &Database,
    id: &str,
    from: &[RowStatus],
    to: RowStatus,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| transition(conn, id, from, to, "", &[]))
}

/// Claims a pending row for an attempt. A row already processing belongs to
/// another delivery and is never claimed twice.
pub fn mark_started(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        transition(
            conn,
            id,
            &[RowStatus::Pending],
            RowStatus::Processing,
            ", attempts = attempts + 1",
            &[],
        )
    })
}

/// Records a successful render. Only a processing row can complete.
pub fn mark_completed(
    db: &Database,
    id: &str,
    output_paths: &[String],
) -> Result<bool, DatabaseError> {
    let encoded = encode_paths(output_paths)?;
    db.with_conn(|conn| {
        transition(
            conn,
            id,
            &[RowStatus::Processing],
            RowStatus::Completed,
            ", output_paths = ?4, error = NULL",
            &[&encoded],
        )
    })
}

/// Records a permanent failure and drops any output reference.
pub fn mark_failed(db: &Database, id: &str, error: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        transition(
            conn,
            id,
            &[RowStatus::Processing],
            RowStatus::Failed,
            ", output_paths = NULL, error = ?4",
            &[&error],
        )
    })
}

/// Puts a processing row back to pending between retry attempts.
pub fn requeue(db: &Database, id: &str, error: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        transition(
            conn,
            id,
            &[RowStatus::Processing],
            RowStatus::Pending,
            ", output_paths = NULL, error = ?4",
            &[&error],
        )
    })
}

/// Moves every row of a batch from `from` to `to`, returning the IDs moved.
pub fn set_status_where(
    conn: &Connection,
    batch_id: &str,
    from: RowStatus,
    to: RowStatus,
) -> Result<Vec<String>, DatabaseError> {
    allowed_sources(&[from], to)?;

    let mut stmt = conn.prepare(
        "SELECT id FROM row_jobs WHERE batch_id = ?1 AND status = ?2 ORDER BY row_index",
    )?;
    let ids = stmt
        .query_map(params![batch_id, from], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    conn.execute(
        "UPDATE row_jobs SET status = ?3, updated_at = ?4 WHERE batch_id = ?1 AND status = ?2",
        params![batch_id, from, to, now_timestamp()],
    )?;
    Ok(ids)
}

/// Deletes a single row job on an open connection, returning it.
pub fn delete(conn: &Connection, id: &str) -> Result<Option<RowJob>, DatabaseError> {
    let existing = {
        let mut stmt = conn.prepare("SELECT * FROM row_jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], from_row)?;
        rows.next().transpose()?
    };
    if existing.is_some() {
        conn.execute("DELETE FROM row_jobs WHERE id = ?1", params![id])?;
    }
    Ok(existing)
}

/// Deletes every row job of a batch, returning all output paths they referenced.
pub fn delete_batch(conn: &Connection, batch_id: &str) -> Result<Vec<String>, DatabaseError> {
    let paths = select_by_batch(conn, batch_id)?
        .into_iter()
        .flat_map(|job| job.output_paths)
        .collect();
    conn.execute("DELETE FROM row_jobs WHERE batch_id = ?1", params![batch_id])?;
    Ok(paths)
}
