//! Test harness for isolated engine runs.
//!
//! `TestEngine` wires a full engine over an in-memory database and a
//! temporary store. Row tasks go to a `RecordingDispatcher`, so each test
//! decides when and in which order deliveries happen.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;

use rowpress::broadcast::{BatchEvent, BatchEventKind};
use rowpress::config::RetryConfig;
use rowpress::engine::ProcessOutcome;
use rowpress::render::Renderer;
use rowpress::storage::{BlobStore, FileStorage};
use rowpress::{BatchService, BatchSummary, Config, Dispatcher, Engine, RowData, RowJob, RowTask};

use super::fakes::{Gate, RecordingDispatcher, ScriptedRenderer, TrapStore};

pub struct TestEngine {
    temp_dir: TempDir,
    pub config: Config,
    pub store: Arc<FileStorage>,
    pub renderer: Arc<ScriptedRenderer>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub engine: Engine,
    pub service: BatchService,
}

impl TestEngine {
    /// Three attempts per row, no backoff delay.
    pub fn new() -> Self {
        Self::build(ScriptedRenderer::new(), |_| {})
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::build(ScriptedRenderer::new(), |config| {
            config.retry.max_attempts = max_attempts;
        })
    }

    pub fn with_gate(gate: Arc<Gate>) -> Self {
        Self::build(ScriptedRenderer::with_gate(gate), |_| {})
    }

    /// The engine writes through a store that panics on any path containing
    /// `marker`. `store` still points at the same files.
    pub fn with_store_trap(marker: &str) -> Self {
        let marker = marker.to_string();
        Self::build_with_store(ScriptedRenderer::new(), |_| {}, move |files| {
            Arc::new(TrapStore::new(files, &marker))
        })
    }

    pub fn build(renderer: ScriptedRenderer, configure: impl FnOnce(&mut Config)) -> Self {
        Self::build_with_store(renderer, configure, |files| files as Arc<dyn BlobStore>)
    }

    pub fn build_with_store(
        renderer: ScriptedRenderer,
        configure: impl FnOnce(&mut Config),
        wrap_store: impl FnOnce(Arc<FileStorage>) -> Arc<dyn BlobStore>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store_root = temp_dir.path().join("store");
        std::fs::create_dir_all(&store_root).expect("Failed to create store root");

        let mut config = Config::default_for(store_root.to_string_lossy());
        config.retry = RetryConfig {
            max_attempts: 3,
            backoff_secs: vec![0],
        };
        config.event_capacity = 4096;
        configure(&mut config);

        let store = Arc::new(FileStorage::new(&store_root));
        let renderer = Arc::new(renderer);
        let engine = Engine::in_memory(
            wrap_store(Arc::clone(&store)),
            Arc::clone(&renderer) as Arc<dyn Renderer>,
            &config,
        )
        .expect("Failed to create engine");

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let service = BatchService::new(
            engine.clone(),
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        );

        Self {
            temp_dir,
            config,
            store,
            renderer,
            dispatcher,
            engine,
            service,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store_root(&self) -> PathBuf {
        self.store.root().to_path_buf()
    }

    /// Submits rows and returns the batch ID. Tasks stay queued.
    pub fn submit(&self, rows: Vec<RowData>) -> String {
        self.service
            .submit_rows("customers.csv", rows)
            .expect("Failed to submit batch")
            .batch_id
    }

    /// Delivers one task; a retry goes back on the queue as the next attempt.
    pub fn deliver(&self, task: &RowTask) -> ProcessOutcome {
        let outcome = self
            .engine
            .processor
            .process(task)
            .expect("Row processing failed");
        if let ProcessOutcome::Retry { .. } = outcome {
            self.dispatcher.push(task.next_attempt());
        }
        outcome
    }

    /// Delivers queued tasks, retries included, until the queue is empty.
    pub fn run_queued(&self) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        while let Some(task) = self.dispatcher.pop() {
            outcomes.push(self.deliver(&task));
        }
        outcomes
    }

    /// Submits rows and runs them to the end.
    pub fn run_batch(&self, rows: Vec<RowData>) -> String {
        let batch_id = self.submit(rows);
        self.run_queued();
        batch_id
    }

    pub fn rows(&self, batch_id: &str) -> Vec<RowJob> {
        self.service.rows(batch_id).expect("Failed to list rows")
    }

    pub fn row(&self, batch_id: &str, row_index: u32) -> RowJob {
        self.rows(batch_id)
            .into_iter()
            .find(|row| row.row_index == row_index)
            .expect("Row not found")
    }

    pub fn summary(&self, batch_id: &str) -> BatchSummary {
        self.service.summary(batch_id).expect("Failed to load summary")
    }

    /// Relative paths of every file below `dir` in the store.
    pub fn files_under(&self, dir: &str) -> Vec<String> {
        let root = self.store.root().to_path_buf();
        let mut files = Vec::new();
        collect_files(&root.join(dir), &root, &mut files);
        files.sort();
        files
    }
}

/// Every event received so far for `batch_id`.
pub fn drain_events(rx: &mut Receiver<BatchEvent>, batch_id: &str) -> Vec<BatchEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.batch_id == batch_id {
            kinds.push(event.kind);
        }
    }
    kinds
}

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, root, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}
