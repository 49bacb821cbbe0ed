use crate::error::StorageError;
use crate::storage::{EntryKind, Storage, StorageEntry};
use std::io::{ErrorKind, Write};
use std::path::Path;
use walkdir::WalkDir;

/// [`Storage`] on the local filesystem
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for LocalStorage {
    fn kind(&self, path: &Path) -> Result<Option<EntryKind>, StorageError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
            Ok(_) => Ok(Some(EntryKind::File)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn walk(&self, root: &Path) -> Result<Vec<StorageEntry>, StorageError> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| StorageError::Walk {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!("Skipping special entry {}", entry.path().display());
                continue;
            };
            let relative_path = match entry.path().strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let len = match kind {
                EntryKind::File => entry.metadata().map(|m| m.len()).unwrap_or(0),
                EntryKind::Directory => 0,
            };
            entries.push(StorageEntry {
                relative_path,
                kind,
                len,
            });
        }
        Ok(entries)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        Ok(std::fs::read(path)?)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::AtomicWriteFailed {
                path: path.to_path_buf(),
                reason: "No parent directory".to_string(),
            })?;

        // Same directory as the target so the final rename stays on one filesystem
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(bytes)?;
        temp_file.as_file().sync_data()?;
        temp_file
            .persist(path)
            .map_err(|e| StorageError::AtomicWriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to persist temp file: {e}"),
            })?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        Ok(std::fs::create_dir_all(path)?)
    }

    fn remove(&self, path: &Path) -> Result<(), StorageError> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let result = if meta.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        Ok(std::fs::rename(from, to)?)
    }
}
