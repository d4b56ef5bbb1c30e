//! Blob storage addressed by relative path strings.

pub mod filesystem;

use std::path::PathBuf;

pub use filesystem::FileStorage;

use crate::error::StorageError;

/// Minimal file store the engine writes row outputs and artifacts to.
///
/// Paths are relative, `/`-separated, and never escape the store root.
pub trait BlobStore: Send + Sync {
    /// Writes `content` at `path`, replacing any existing file. The write is
    /// atomic: readers see either the old content or the new one.
    fn put(&self, path: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Creates a new file at `path`, or at `<stem>_N.<ext>` if the name is
    /// taken. Returns the path actually used.
    fn put_new(&self, path: &str, content: &[u8]) -> Result<String, StorageError>;

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    fn exists(&self, path: &str) -> bool;

    /// Size in bytes, or `StorageError::NotFound`.
    fn size(&self, path: &str) -> Result<u64, StorageError>;

    /// Deletes a file. Returns `false` if it did not exist.
    fn delete(&self, path: &str) -> Result<bool, StorageError>;

    /// Deletes a directory and everything below it. Returns `false` if it did
    /// not exist.
    fn delete_dir(&self, path: &str) -> Result<bool, StorageError>;

    /// Absolute location of `path`, for handing a file to a consumer.
    fn local_path(&self, path: &str) -> Result<PathBuf, StorageError>;
}

/// Deletes every path, logging instead of failing on individual errors.
/// Returns how many files were removed.
pub fn delete_all<'a, I>(store: &dyn BlobStore, paths: I) -> usize
where
    I: IntoIterator<Item = &'a String>,
{
    let mut removed = 0;
    for path in paths {
        match store.delete(path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %path, error = %e, "Failed to delete file"),
        }
    }
    removed
}
