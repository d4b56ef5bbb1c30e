use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::{Dispatcher, RowTask, TaskHandler};
use crate::error::WorkerError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A task waiting for its redelivery time.
struct Delayed {
    due: Instant,
    seq: u64,
    task: RowTask,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the max-heap yields the earliest due task first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Fixed set of worker threads consuming row tasks.
///
/// Tasks whose handler asks for redelivery go through a scheduler thread
/// that re-queues them once their backoff has elapsed.
pub struct WorkerPool {
    task_sender: Sender<RowTask>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` workers running `handler`.
    pub fn new<H: TaskHandler>(handler: Arc<H>, worker_count: usize) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        let (task_sender, task_receiver) = unbounded::<RowTask>();
        let (delay_sender, delay_receiver) = unbounded::<Delayed>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let seq = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = task_receiver.clone();
            let delay_tx = delay_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_handler = Arc::clone(&handler);
            let worker_seq = Arc::clone(&seq);

            let handle = thread::Builder::new()
                .name(format!("rowpress-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(
                        worker_id,
                        task_rx,
                        delay_tx,
                        shutdown_flag,
                        worker_handler,
                        worker_seq,
                    );
                })
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }
        drop(delay_sender);

        let scheduler_tx = task_sender.clone();
        let scheduler_shutdown = Arc::clone(&shutdown);
        let scheduler = thread::Builder::new()
            .name("rowpress-retry".to_string())
            .spawn(move || run_scheduler(delay_receiver, scheduler_tx, scheduler_shutdown))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        info!("Started {} workers", worker_count);

        Ok(Self {
            task_sender,
            workers,
            scheduler: Some(scheduler),
            shutdown,
        })
    }

    /// Tasks waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.task_sender.len()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stops the pool and joins every thread. Workers finish the task in
    /// hand; queued and delayed tasks are dropped and their rows stay
    /// `pending` in the store.
    pub fn wait(mut self) {
        self.shutdown();
        drop(self.task_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            if scheduler.join().is_err() {
                error!("Retry scheduler panicked");
            }
        }

        info!("All workers have stopped");
    }
}

impl Dispatcher for WorkerPool {
    fn dispatch(&self, task: RowTask) -> Result<(), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ChannelClosed);
        }

        self.task_sender
            .send(task)
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

fn run_worker<H: TaskHandler>(
    worker_id: usize,
    task_receiver: Receiver<RowTask>,
    delay_sender: Sender<Delayed>,
    shutdown: Arc<AtomicBool>,
    handler: Arc<H>,
    seq: Arc<AtomicU64>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match task_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => {
                debug!(
                    "Worker {} processing row job {} (attempt {})",
                    worker_id, task.row_job_id, task.attempt
                );

                let redeliver = match catch_unwind(AssertUnwindSafe(|| handler.handle(&task))) {
                    Ok(redeliver) => redeliver,
                    Err(_) => {
                        error!(
                            "Worker {} panicked while handling row job {}",
                            worker_id, task.row_job_id
                        );
                        None
                    }
                };

                if let Some(delay) = redeliver {
                    let delayed = Delayed {
                        due: Instant::now() + delay,
                        seq: seq.fetch_add(1, Ordering::Relaxed),
                        task: task.next_attempt(),
                    };
                    if delay_sender.send(delayed).is_err() {
                        warn!(
                            "Worker {} could not schedule retry of row job {}",
                            worker_id, task.row_job_id
                        );
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn run_scheduler(
    delay_receiver: Receiver<Delayed>,
    task_sender: Sender<RowTask>,
    shutdown: Arc<AtomicBool>,
) {
    let mut queue: BinaryHeap<Delayed> = BinaryHeap::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            if !queue.is_empty() {
                warn!("Dropping {} scheduled retries on shutdown", queue.len());
            }
            break;
        }

        let now = Instant::now();
        while queue.peek().is_some_and(|next| next.due <= now) {
            if let Some(next) = queue.pop() {
                if task_sender.send(next.task).is_err() {
                    return;
                }
            }
        }

        let timeout = queue
            .peek()
            .map(|next| next.due.saturating_duration_since(now).min(POLL_INTERVAL))
            .unwrap_or(POLL_INTERVAL);

        match delay_receiver.recv_timeout(timeout) {
            Ok(delayed) => queue.push(delayed),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                if queue.is_empty() {
                    break;
                }
                thread::sleep(timeout);
            }
        }
    }
}
