pub mod pdf;

pub use pdf::PdfRenderer;

use crate::error::RenderError;
use crate::model::RowData;

/// Turns one input row into document bytes.
///
/// Implementations may block for as long as rendering takes; they run on
/// worker threads. Returning empty bytes counts as a failure.
pub trait Renderer: Send + Sync {
    fn render(&self, row: &RowData) -> Result<Vec<u8>, RenderError>;

    /// File extension of the produced documents, without the dot.
    fn extension(&self) -> &str {
        "pdf"
    }
}
