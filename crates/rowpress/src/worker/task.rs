use serde::{Deserialize, Serialize};

/// One delivery of a row job to the row processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowTask {
    pub row_job_id: String,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

impl RowTask {
    pub fn new(row_job_id: impl Into<String>) -> Self {
        Self {
            row_job_id: row_job_id.into(),
            attempt: 1,
        }
    }

    /// The redelivery of this task after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            row_job_id: self.row_job_id.clone(),
            attempt: self.attempt + 1,
        }
    }
}
