use crate::error::StorageError;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}

/// One entry of a recursive listing, relative to the listed root.
/// Parents are always listed before their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub relative_path: PathBuf,
    pub kind: EntryKind,
    pub len: u64,
}

/// Filesystem operations used by the node tree. All paths are absolute.
pub trait Storage: Send + Sync {
    /// Kind of the entry at `path`, or `None` when nothing exists there
    fn kind(&self, path: &Path) -> Result<Option<EntryKind>, StorageError>;
    fn walk(&self, root: &Path) -> Result<Vec<StorageEntry>, StorageError>;
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;
    /// Replace the file at `path` so readers see either the old or the new bytes
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError>;
    /// Remove a file or a whole directory; a missing entry is not an error
    fn remove(&self, path: &Path) -> Result<(), StorageError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError>;
}
