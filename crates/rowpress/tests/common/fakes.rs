//! Fake collaborators: a renderer scripted by row content, a dispatcher
//! that records tasks instead of running them, and a store that blows up on
//! chosen writes.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rowpress::error::{RenderError, StorageError};
use rowpress::render::Renderer;
use rowpress::storage::{BlobStore, FileStorage};
use rowpress::{Dispatcher, RowData, RowTask, WorkerError};

use super::builders::MODE;

const GATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds a `block` render until the test releases it.
pub struct Gate {
    entered_tx: Mutex<Sender<()>>,
    entered_rx: Mutex<Receiver<()>>,
    release_tx: Mutex<Sender<()>>,
    release_rx: Mutex<Receiver<()>>,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        Arc::new(Self {
            entered_tx: Mutex::new(entered_tx),
            entered_rx: Mutex::new(entered_rx),
            release_tx: Mutex::new(release_tx),
            release_rx: Mutex::new(release_rx),
        })
    }

    /// Blocks until a render has reached the gate.
    pub fn wait_entered(&self) {
        self.entered_rx
            .lock()
            .unwrap()
            .recv_timeout(GATE_TIMEOUT)
            .expect("render never reached the gate");
    }

    pub fn release(&self) {
        self.release_tx.lock().unwrap().send(()).unwrap();
    }

    fn pass(&self) {
        self.entered_tx.lock().unwrap().send(()).unwrap();
        self.release_rx
            .lock()
            .unwrap()
            .recv_timeout(GATE_TIMEOUT)
            .expect("render was never released");
    }
}

/// Renders by the row's `mode` column:
/// - `fail`: always errors
/// - `flaky`: errors on the first call for a reference, then succeeds
/// - `panic`: panics
/// - `empty`: returns no bytes
/// - `block`: waits on the gate, then succeeds
/// - anything else: succeeds
pub struct ScriptedRenderer {
    calls: AtomicUsize,
    seen: Mutex<HashMap<String, u32>>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(HashMap::new()),
            gate: None,
        }
    }

    pub fn with_gate(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for ScriptedRenderer {
    fn render(&self, row: &RowData) -> Result<Vec<u8>, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reference = row.get("reference").unwrap_or("").to_string();

        match row.get(MODE).unwrap_or("") {
            "fail" => return Err(RenderError::Failed("scripted failure".to_string())),
            "flaky" => {
                let mut seen = self.seen.lock().unwrap();
                let count = seen.entry(reference.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    return Err(RenderError::Failed("first attempt fails".to_string()));
                }
            }
            "panic" => panic!("scripted panic for {}", reference),
            "empty" => return Ok(Vec::new()),
            "block" => {
                if let Some(gate) = &self.gate {
                    gate.pass();
                }
            }
            _ => {}
        }

        Ok(format!("%PDF-1.4 fake document {}", reference).into_bytes())
    }
}

/// Queues dispatched tasks for the test to run by hand.
#[derive(Default)]
pub struct RecordingDispatcher {
    queue: Mutex<VecDeque<RowTask>>,
    total: AtomicUsize,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<RowTask> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn take_all(&self) -> Vec<RowTask> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Tasks dispatched since creation, drained or not.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn push(&self, task: RowTask) {
        self.queue.lock().unwrap().push_back(task);
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, task: RowTask) -> Result<(), WorkerError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.push(task);
        Ok(())
    }
}

/// Delegates to a `FileStorage` but panics when writing a path that
/// contains `marker`.
pub struct TrapStore {
    inner: Arc<FileStorage>,
    marker: String,
}

impl TrapStore {
    pub fn new(inner: Arc<FileStorage>, marker: &str) -> Self {
        Self {
            inner,
            marker: marker.to_string(),
        }
    }
}

impl BlobStore for TrapStore {
    fn put(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        if path.contains(&self.marker) {
            panic!("store trap hit for {}", path);
        }
        self.inner.put(path, content)
    }

    fn put_new(&self, path: &str, content: &[u8]) -> Result<String, StorageError> {
        self.inner.put_new(path, content)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.read(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.inner.size(path)
    }

    fn delete(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.delete(path)
    }

    fn delete_dir(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.delete_dir(path)
    }

    fn local_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.inner.local_path(path)
    }
}
