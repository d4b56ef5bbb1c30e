use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Root directory of the blob store.
    pub storage_root: String,
    /// Defaults to `~/.rowpress/data/rowpress.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_pause_ttl_secs")]
    pub pause_ttl_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_pause_ttl_secs() -> u64 {
    3600
}

fn default_event_capacity() -> usize {
    1000
}

impl Config {
    /// Config with every default filled in, rooted at `storage_root`.
    pub fn default_for(storage_root: impl Into<String>) -> Self {
        Self {
            version: "1.0".to_string(),
            storage_root: storage_root.into(),
            database_path: None,
            worker_count: default_worker_count(),
            pause_ttl_secs: default_pause_ttl_secs(),
            event_capacity: default_event_capacity(),
            retry: RetryConfig::default(),
            output: OutputConfig::default(),
        }
    }

    pub fn pause_ttl(&self) -> Duration {
        Duration::from_secs(self.pause_ttl_secs)
    }

    /// The configured database path, or the per-user default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per row, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff_secs[n - 1]`; the last value
    /// repeats.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![60, 300, 900]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Row documents are named `<filename_prefix>_<reference>.pdf`.
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    /// Column whose value names the row document.
    #[serde(default = "default_reference_field")]
    pub reference_field: String,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    /// Heading printed on each row document.
    #[serde(default = "default_document_title")]
    pub document_title: String,
}

fn default_filename_prefix() -> String {
    "document".to_string()
}

fn default_reference_field() -> String {
    "reference".to_string()
}

fn default_archive_prefix() -> String {
    "documents".to_string()
}

fn default_document_title() -> String {
    "Document".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            filename_prefix: default_filename_prefix(),
            reference_field: default_reference_field(),
            archive_prefix: default_archive_prefix(),
            document_title: default_document_title(),
        }
    }
}
