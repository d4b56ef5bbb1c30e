use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use rowpress::{
    BatchService, BatchSummary, Config, Dispatcher, Engine, RowTask, WorkerError, WorkerPool,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Dispatcher for commands that never start row work.
struct Offline;

impl Dispatcher for Offline {
    fn dispatch(&self, _task: RowTask) -> Result<(), WorkerError> {
        Err(WorkerError::ChannelClosed)
    }
}

fn offline_service(config: &Config) -> Result<BatchService> {
    let engine = Engine::from_config(config).context("failed to open rowpress storage")?;
    Ok(BatchService::new(engine, Arc::new(Offline)))
}

/// Runs `f` with a service backed by a live worker pool, then stops the pool.
fn with_pool<T>(config: &Config, f: impl FnOnce(&BatchService) -> Result<T>) -> Result<T> {
    let engine = Engine::from_config(config).context("failed to open rowpress storage")?;
    let pool = Arc::new(WorkerPool::new(Arc::clone(&engine.processor), config.worker_count)?);
    let service = BatchService::new(engine, Arc::clone(&pool) as Arc<dyn Dispatcher>);

    let result = f(&service);

    drop(service);
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.wait(),
        Err(pool) => pool.shutdown(),
    }
    result
}

pub fn run(config: &Config, input: &Path, wait: bool) -> Result<()> {
    with_pool(config, |service| {
        let submitted = service
            .submit_csv(input)
            .with_context(|| format!("failed to submit {}", input.display()))?;

        println!("batch {}", submitted.batch_id);
        println!("  rows: {}", submitted.total_rows);
        if submitted.skipped_records > 0 {
            println!("  skipped records: {}", submitted.skipped_records);
        }

        if wait {
            wait_for_batch(service, &submitted.batch_id)?;
        }
        Ok(())
    })
}

pub fn resume(config: &Config, batch_id: &str, wait: bool) -> Result<()> {
    with_pool(config, |service| {
        // Covers paused rows and rows an earlier run left processing.
        let recovery = service.recover(batch_id)?;
        println!(
            "batch {}: {} rows resumed, {} rows reclaimed, {} rows dispatched",
            batch_id, recovery.resumed, recovery.reclaimed, recovery.dispatched
        );

        if wait {
            wait_for_batch(service, batch_id)?;
        }
        Ok(())
    })
}

/// Polls until the batch settles. Ctrl-C pauses the batch instead.
fn wait_for_batch(service: &BatchService, batch_id: &str) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    let mut last_progress = -1.0;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            let parked = service.pause(batch_id)?;
            warn!(batch_id, parked, "Interrupted, batch paused");
            println!("paused; continue with `rowpress resume {}`", batch_id);
            return Ok(());
        }

        let summary = service.summary(batch_id)?;
        if summary.progress != last_progress {
            last_progress = summary.progress;
            info!(
                batch_id,
                progress = summary.progress,
                completed = summary.counts.completed,
                failed = summary.counts.failed,
                "Progress"
            );
        }
        if summary.is_settled() {
            print_outcome(service, &summary);
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn print_outcome(service: &BatchService, summary: &BatchSummary) {
    println!(
        "batch {} {}: {} completed, {} failed",
        summary.batch.id,
        summary.state,
        summary.counts.completed,
        summary.counts.failed
    );
    match service.resolve_download(&summary.batch.id) {
        Ok(download) => println!("download: {}", download.path.display()),
        Err(_) => println!("download: {}", summary.batch.download_status),
    }
}

pub fn status(config: &Config, batch_id: &str, rows: bool, json: bool) -> Result<()> {
    let service = offline_service(config)?;
    let summary = service.summary(batch_id)?;
    let row_jobs = if rows { service.rows(batch_id)? } else { Vec::new() };

    if json {
        let value = serde_json::json!({ "summary": summary, "rows": row_jobs });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let c = &summary.counts;
    println!("batch {} ({})", summary.batch.id, summary.batch.original_filename);
    println!("  state:      {}", summary.state);
    println!("  progress:   {:.1}%", summary.progress);
    println!(
        "  rows:       {} total, {} pending, {} processing, {} paused, {} completed, {} failed",
        c.total, c.pending, c.processing, c.paused, c.completed + c.download_failed, c.failed
    );
    println!("  download:   {}", summary.batch.download_status);
    if let Some(artifact) = summary.batch.artifact() {
        println!("  artifact:   {} ({})", artifact.path, artifact.kind);
    }

    for job in &row_jobs {
        match &job.error {
            Some(error) => println!("  #{:<5} {:<15} {}", job.row_index, job.status, error),
            None => println!("  #{:<5} {}", job.row_index, job.status),
        }
    }
    Ok(())
}

pub fn list(config: &Config, limit: u32) -> Result<()> {
    let service = offline_service(config)?;
    let summaries = service.list(limit)?;
    if summaries.is_empty() {
        println!("no batches");
        return Ok(());
    }
    for summary in summaries {
        println!(
            "{}  {:<22} {:>6.1}%  {:<17} {}",
            summary.batch.id,
            summary.state,
            summary.progress,
            summary.batch.download_status,
            summary.batch.original_filename
        );
    }
    Ok(())
}

pub fn download(config: &Config, batch_id: &str) -> Result<()> {
    let service = offline_service(config)?;
    let download = service.resolve_download(batch_id)?;
    println!("{}", download.path.display());
    println!("  name: {}", download.filename);
    println!("  type: {}", download.content_type);
    Ok(())
}

pub fn remove(config: &Config, batch_id: &str, force: bool) -> Result<()> {
    let service = offline_service(config)?;
    let deleted = if force {
        service.force_remove(batch_id)?
    } else {
        service.delete(batch_id)?
    };
    println!("batch {} removed, {} files deleted", batch_id, deleted);
    Ok(())
}

pub fn remove_row(config: &Config, row_job_id: &str) -> Result<()> {
    let service = offline_service(config)?;
    let deleted = service.delete_row(row_job_id)?;
    println!("row {} removed, {} files deleted", row_job_id, deleted);
    Ok(())
}
