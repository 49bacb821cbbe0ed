use filebundle::error::StorageError;
use filebundle::storage::{EntryKind, LocalStorage, Storage, StorageEntry};
use filebundle::{BundleRoot, FileBundle, SyncConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Local storage that counts mutating operations
#[derive(Default)]
pub struct CountingStorage {
    inner: LocalStorage,
    writes: AtomicUsize,
    removes: AtomicUsize,
    renames: AtomicUsize,
    reads: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub writes: usize,
    pub removes: usize,
    pub renames: usize,
    pub reads: usize,
}

impl OpCounts {
    pub fn since(self, earlier: OpCounts) -> OpCounts {
        OpCounts {
            writes: self.writes - earlier.writes,
            removes: self.removes - earlier.removes,
            renames: self.renames - earlier.renames,
            reads: self.reads - earlier.reads,
        }
    }

    pub fn mutations(&self) -> usize {
        self.writes + self.removes + self.renames
    }
}

impl CountingStorage {
    pub fn counts(&self) -> OpCounts {
        OpCounts {
            writes: self.writes.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
            renames: self.renames.load(Ordering::SeqCst),
            reads: self.reads.load(Ordering::SeqCst),
        }
    }
}

impl Storage for CountingStorage {
    fn kind(&self, path: &Path) -> Result<Option<EntryKind>, StorageError> {
        self.inner.kind(path)
    }

    fn walk(&self, root: &Path) -> Result<Vec<StorageEntry>, StorageError> {
        self.inner.walk(root)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(path)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_atomic(path, bytes)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StorageError> {
        self.inner.create_dir_all(path)
    }

    fn remove(&self, path: &Path) -> Result<(), StorageError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.inner.rename(from, to)
    }
}

/// Open `path` as a bundle of type `B` on a counting storage
pub fn open_counted<B: FileBundle>(
    path: &Path,
    config: SyncConfig,
) -> (BundleRoot<B>, Arc<CountingStorage>) {
    let storage = Arc::new(CountingStorage::default());
    let root = BundleRoot::open_with_storage(storage.clone(), path, config).unwrap();
    (root, storage)
}

/// Flush now and let any flush scheduled in the meantime finish
pub fn settle<B: FileBundle>(root: &BundleRoot<B>) {
    root.commit().unwrap();
    root.wait_idle();
}
