//! Batch progress broadcaster for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ArtifactKind, RowStatus};

/// What happened to a batch or one of its rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEventKind {
    /// A row reached `completed` or `failed`.
    RowFinished {
        row_job_id: String,
        row_index: u32,
        status: RowStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Every row is terminal.
    BatchCompleted { completed: u32, failed: u32 },
    DownloadStarted,
    DownloadReady { path: String, kind: ArtifactKind },
    DownloadFailed { error: String },
    BatchPaused { paused_rows: usize },
    BatchResumed { resumed_rows: usize },
    BatchRemoved { deleted_files: usize },
    RowRemoved {
        row_job_id: String,
        row_index: u32,
        deleted_files: usize,
    },
}

/// Event published on the batch channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub batch_id: String,
    #[serde(flatten)]
    pub kind: BatchEventKind,
    pub timestamp: DateTime<Utc>,
}

impl BatchEvent {
    pub fn new(batch_id: &str, kind: BatchEventKind) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Whether this event settles the batch from a consumer's point of view.
    pub fn is_final(&self) -> bool {
        matches!(
            self.kind,
            BatchEventKind::DownloadReady { .. }
                | BatchEventKind::DownloadFailed { .. }
                | BatchEventKind::BatchRemoved { .. }
        )
    }
}

/// Broadcasts batch events to any number of subscribers.
#[derive(Clone)]
pub struct BatchEventBroadcaster {
    sender: Arc<broadcast::Sender<BatchEvent>>,
}

impl BatchEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: BatchEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, batch_id: &str, kind: BatchEventKind) {
        self.send(BatchEvent::new(batch_id, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BatchEventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}
