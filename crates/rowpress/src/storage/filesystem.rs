use std::io::Write;
use std::path::{Component, Path, PathBuf};

use super::BlobStore;
use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem) and falls back to copy + delete for cross-device moves.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => (&filename[..dot_pos], Some(&filename[dot_pos..])),
        _ => (filename, None),
    }
}

/// Blob store rooted at a local directory.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a relative store path onto the root, rejecting anything that
    /// could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    fn ensure_parent(&self, file: &Path) -> Result<(), StorageError> {
        if let Some(parent) = file.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

impl BlobStore for FileStorage {
    fn put(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        self.ensure_parent(&target)?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        let temp = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        std::fs::write(&temp, content).map_err(|e| StorageError::WriteFile {
            path: temp.clone(),
            source: e,
        })?;
        if let Err(e) = move_file(&temp, &target) {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
        Ok(())
    }

    fn put_new(&self, path: &str, content: &[u8]) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        self.ensure_parent(&target)?;

        let (dir, filename) = match path.rfind('/') {
            Some(slash) => (&path[..=slash], &path[slash + 1..]),
            None => ("", path),
        };
        let (base, ext) = split_extension(filename);

        for counter in 1..=1000 {
            let candidate = if counter == 1 {
                path.to_string()
            } else {
                format!("{}{}_{}{}", dir, base, counter, ext.unwrap_or(""))
            };
            let full = self.resolve(&candidate)?;

            // create_new is the atomic check-and-create.
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&full)
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(content).and_then(|_| file.sync_all()) {
                        drop(file);
                        let _ = std::fs::remove_file(&full);
                        return Err(StorageError::WriteFile {
                            path: full,
                            source: e,
                        });
                    }
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StorageError::WriteFile {
                        path: full,
                        source: e,
                    })
                }
            }
        }

        Err(StorageError::FileExists(target))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::ReadFile {
                    path: full,
                    source: e,
                }
            }
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        let full = self.resolve(path)?;
        match std::fs::metadata(&full) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(StorageError::NotFound(path.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::ReadFile {
                path: full,
                source: e,
            }),
        }
    }

    fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFile {
                path: full,
                source: e,
            }),
        }
    }

    fn delete_dir(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        match std::fs::remove_dir_all(&full) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFile {
                path: full,
                source: e,
            }),
        }
    }

    fn local_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.resolve(path)
    }
}
