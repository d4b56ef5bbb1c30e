pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod model;
pub mod render;
pub mod sanitize;
pub mod service;
pub mod storage;
pub mod worker;

pub use broadcast::{BatchEvent, BatchEventBroadcaster};
pub use config::{load_config, Config};
pub use db::Database;
pub use engine::{CompletionDetector, DetectorOutcome, Engine, Packager, PauseFlags, RowProcessor};
pub use error::{
    BatchError, ConfigError, IngestError, PackagingError, RenderError, Result, RowpressError,
    StorageError, WorkerError,
};
pub use model::{
    Artifact, ArtifactKind, Batch, BatchState, BatchSummary, DownloadStatus, RowData, RowJob,
    RowStatus, StatusCounts,
};
pub use service::{BatchService, Download, Recovery, SubmittedBatch};
pub use worker::{Dispatcher, RetryPolicy, RowTask, WorkerPool};
