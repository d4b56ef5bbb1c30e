use std::path::PathBuf;
use thiserror::Error;

use crate::model::{BatchState, DownloadStatus};

#[derive(Error, Debug)]
pub enum RowpressError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read input file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV input has no header row")]
    MissingHeader,

    #[error("CSV input contains no data rows")]
    Empty,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete '{path}': {source}")]
    DeleteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File already exists: {0}")]
    FileExists(PathBuf),

    #[error("File not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Rendering failed: {0}")]
    Failed(String),

    #[error("Failed to build PDF: {0}")]
    Pdf(String),

    #[error("Renderer panicked: {0}")]
    Panicked(String),

    #[error("Renderer produced an empty document")]
    EmptyOutput,
}

#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("No completed outputs to package")]
    NothingToPackage,

    #[error("Output file missing: {0}")]
    MissingOutput(String),

    #[error("Artifact '{0}' was not created properly")]
    EmptyArtifact(String),

    #[error("Batch {0} was removed while packaging")]
    BatchRemoved(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error while building archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch not found: {0}")]
    NotFound(String),

    #[error("Batch {batch_id} cannot be deleted while {state}")]
    NotDeletable { batch_id: String, state: BatchState },

    #[error("Row job not found: {0}")]
    RowNotFound(String),

    #[error("Row {row_job_id} cannot be deleted while batch {batch_id} download is {download_status}")]
    RowNotDeletable {
        row_job_id: String,
        batch_id: String,
        download_status: DownloadStatus,
    },

    #[error("Download not available for batch {0}")]
    DownloadNotReady(String),
}

pub type Result<T> = std::result::Result<T, RowpressError>;
