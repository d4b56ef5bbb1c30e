//! Domain model: row jobs, batches, and the row state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a single row job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Paused,
    /// Completed row whose batch packaging failed. Keeps its outputs.
    DownloadFailed,
}

impl RowStatus {
    pub const ALL: [RowStatus; 6] = [
        RowStatus::Pending,
        RowStatus::Processing,
        RowStatus::Completed,
        RowStatus::Failed,
        RowStatus::Paused,
        RowStatus::DownloadFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Processing => "processing",
            RowStatus::Completed => "completed",
            RowStatus::Failed => "failed",
            RowStatus::Paused => "paused",
            RowStatus::DownloadFailed => "download_failed",
        }
    }

    /// Whether the row counts as finished for batch completion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RowStatus::Completed | RowStatus::Failed | RowStatus::DownloadFailed
        )
    }

    /// Whether the row carries output files.
    pub fn has_outputs(&self) -> bool {
        matches!(self, RowStatus::Completed | RowStatus::DownloadFailed)
    }

    /// Allowed transitions of the row state machine. Every status update in
    /// `db::row_job_repo` is guarded by this table.
    ///
    /// `Processing -> Pending` is the requeue between retry attempts (and the
    /// reclaim of a row whose worker went away). `Processing -> Paused` parks a
    /// row redelivered while its batch is paused. `Completed <-> DownloadFailed`
    /// is driven by packaging. A processing row can never be claimed again
    /// while it stays processing.
    pub fn can_transition_to(&self, next: RowStatus) -> bool {
        use RowStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Pending, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Processing, Paused)
                | (Paused, Pending)
                | (Completed, DownloadFailed)
                | (DownloadFailed, Completed)
        )
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for RowStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Batch-wide download state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    CreatingDownload,
    Ready,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::CreatingDownload => "creating_download",
            DownloadStatus::Ready => "ready",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "creating_download" => Ok(DownloadStatus::CreatingDownload),
            "ready" => Ok(DownloadStatus::Ready),
            "failed" => Ok(DownloadStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The lone row output, offered as-is.
    Single,
    /// A zip archive of every row output.
    Archive,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Single => "single",
            ArtifactKind::Archive => "archive",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ArtifactKind::Single),
            "archive" => Ok(ArtifactKind::Archive),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// The downloadable result of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub kind: ArtifactKind,
}

/// Ordered column/value pairs of one input row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowData(Vec<(String, String)>);

impl RowData {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RowData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One unit of work: one input row rendered to one document.
#[derive(Debug, Clone, Serialize)]
pub struct RowJob {
    pub id: String,
    pub batch_id: String,
    pub row_index: u32,
    pub row_data: RowData,
    pub status: RowStatus,
    /// Set only while the row is completed (or download_failed).
    pub output_paths: Vec<String>,
    /// Number of processing attempts started.
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RowJob {
    pub fn new(batch_id: &str, row_index: u32, row_data: RowData, now: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            row_index,
            row_data,
            status: RowStatus::Pending,
            output_paths: Vec::new(),
            attempts: 0,
            error: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// A batch: every row job created from one submitted input file.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: String,
    /// Name of the submitted input file, used to name the archive.
    pub original_filename: String,
    pub total_rows: u32,
    pub download_status: DownloadStatus,
    pub artifact_path: Option<String>,
    pub artifact_kind: Option<ArtifactKind>,
    pub created_at: String,
    pub updated_at: String,
}

impl Batch {
    pub fn new(original_filename: &str, total_rows: u32, now: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_filename: original_filename.to_string(),
            total_rows,
            download_status: DownloadStatus::Pending,
            artifact_path: None,
            artifact_kind: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    pub fn artifact(&self) -> Option<Artifact> {
        match (&self.artifact_path, self.artifact_kind) {
            (Some(path), Some(kind)) if !path.is_empty() => Some(Artifact {
                path: path.clone(),
                kind,
            }),
            _ => None,
        }
    }

    /// True once packaging has run or is running for this batch.
    pub fn packaging_claimed(&self) -> bool {
        self.artifact_path.as_deref().is_some_and(|p| !p.is_empty())
            || matches!(
                self.download_status,
                DownloadStatus::Ready | DownloadStatus::CreatingDownload
            )
    }
}

/// Row counts of a batch by status.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: u32,
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    pub failed: u32,
    pub paused: u32,
    pub download_failed: u32,
}

impl StatusCounts {
    pub fn from_rows(rows: &[RowJob]) -> Self {
        rows.iter().fold(Self::default(), |mut counts, row| {
            counts.add(row.status);
            counts
        })
    }

    pub fn add(&mut self, status: RowStatus) {
        self.total += 1;
        match status {
            RowStatus::Pending => self.pending += 1,
            RowStatus::Processing => self.processing += 1,
            RowStatus::Completed => self.completed += 1,
            RowStatus::Failed => self.failed += 1,
            RowStatus::Paused => self.paused += 1,
            RowStatus::DownloadFailed => self.download_failed += 1,
        }
    }

    /// Rows that reached a terminal state.
    pub fn finished(&self) -> u32 {
        self.completed + self.failed + self.download_failed
    }

    /// Every row is terminal. An empty batch is never terminal.
    pub fn is_terminal(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.processing == 0 && self.finished() == self.total
    }

    /// Percentage of finished rows, rounded to one decimal.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = f64::from(self.finished()) / f64::from(self.total) * 100.0;
        (pct * 10.0).round() / 10.0
    }
}

/// Overall state of a batch as shown to users.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Processing,
    Paused,
    Completed,
    CompletedWithErrors,
    /// Every row finished but packaging the download failed.
    DownloadFailed,
}

impl BatchState {
    pub fn derive(counts: &StatusCounts, download_status: DownloadStatus) -> Self {
        if download_status == DownloadStatus::Failed || counts.download_failed > 0 {
            BatchState::DownloadFailed
        } else if counts.is_terminal() {
            if counts.failed > 0 {
                BatchState::CompletedWithErrors
            } else {
                BatchState::Completed
            }
        } else if counts.paused > 0 && counts.processing == 0 {
            BatchState::Paused
        } else if counts.processing > 0 || counts.finished() > 0 {
            BatchState::Processing
        } else {
            BatchState::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Processing => "processing",
            BatchState::Paused => "paused",
            BatchState::Completed => "completed",
            BatchState::CompletedWithErrors => "completed_with_errors",
            BatchState::DownloadFailed => "download_failed",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Derived view over a batch and its rows.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch: Batch,
    pub counts: StatusCounts,
    pub state: BatchState,
    pub progress: f64,
}

impl BatchSummary {
    pub fn new(batch: Batch, counts: StatusCounts) -> Self {
        Self {
            state: BatchState::derive(&counts, batch.download_status),
            progress: counts.progress(),
            batch,
            counts,
        }
    }

    pub fn download_available(&self) -> bool {
        self.batch.download_status == DownloadStatus::Ready && self.batch.artifact().is_some()
    }

    /// Terminal and no packaging step is still outstanding.
    pub fn is_settled(&self) -> bool {
        if !self.counts.is_terminal() {
            return false;
        }
        match self.batch.download_status {
            DownloadStatus::Ready | DownloadStatus::Failed => true,
            DownloadStatus::CreatingDownload => false,
            DownloadStatus::Pending => self.counts.completed + self.counts.download_failed == 0,
        }
    }
}
