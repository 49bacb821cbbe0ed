//! Synchronization root
//!
//! Opens a bundle directory, binds the top-level bundle to it and flushes the
//! node tree to disk a short while after the last change anywhere below.

use super::{BundleScope, FileBundle};
use crate::config::SyncConfig;
use crate::error::{BundleError, SyncError};
use crate::node::{FlushReport, Node};
use crate::relay::{ChangeListener, Observers, Parent, Subscription};
use crate::schedule::Debouncer;
use crate::storage::{EntryKind, LocalStorage, Storage};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

struct RootShared {
    me: Weak<RootShared>,
    path: PathBuf,
    node: Node,
    scheduler: Debouncer,
    observers: Observers,
    last_error: Mutex<Option<String>>,
}

impl RootShared {
    fn flush(&self) -> Result<FlushReport, SyncError> {
        let report = self.node.flush()?;
        if !report.is_empty() {
            tracing::info!(
                bundle = %self.path.display(),
                written = report.written,
                removed = report.removed,
                renamed = report.renamed,
                created_dirs = report.created_dirs,
                "Flushed bundle"
            );
        }
        Ok(report)
    }

    fn schedule_flush(&self) {
        let weak = self.me.clone();
        self.scheduler.schedule(move || {
            if let Some(root) = weak.upgrade() {
                if let Err(e) = root.flush() {
                    tracing::error!(
                        bundle = %root.path.display(),
                        "Background flush failed: {}",
                        e
                    );
                    *root.last_error.lock() = Some(e.to_string());
                }
            }
        });
    }
}

impl ChangeListener for RootShared {
    fn child_did_update(&self) {
        self.observers.notify();
        self.schedule_flush();
    }

    fn child_did_write(&self) {
        self.schedule_flush();
    }
}

/// A bundle bound to a directory on disk
pub struct BundleRoot<B: FileBundle> {
    bundle: Arc<B>,
    shared: Arc<RootShared>,
    config: Arc<SyncConfig>,
}

impl<B: FileBundle> BundleRoot<B> {
    /// Open the bundle at `path` on the local filesystem
    pub fn open(path: impl AsRef<Path>, config: SyncConfig) -> Result<Self, SyncError> {
        Self::open_with_storage(Arc::new(LocalStorage::new()), path, config)
    }

    pub fn open_with_storage(
        storage: Arc<dyn Storage>,
        path: impl AsRef<Path>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let path = path.as_ref();
        match storage.kind(path)? {
            Some(EntryKind::Directory) => {}
            Some(EntryKind::File) => {
                return Err(BundleError::NotADirectory(path.to_path_buf()).into());
            }
            None if config.create_if_needed => {
                tracing::info!(bundle = %path.display(), "Creating bundle directory");
                storage.create_dir_all(path)?;
            }
            None => return Err(BundleError::NotFound(path.to_path_buf()).into()),
        }
        let path = dunce::canonicalize(path)?;

        let node = Node::open(storage, &path, config.ignored_names.clone())?;
        let config = Arc::new(config);
        let shared = Arc::new_cyclic(|me| RootShared {
            me: me.clone(),
            path: path.clone(),
            node: node.clone(),
            scheduler: Debouncer::new("flush", config.flush_delay()),
            observers: Observers::new(),
            last_error: Mutex::new(None),
        });

        let listener: Weak<dyn ChangeListener> = Arc::downgrade(&shared) as Weak<RootShared>;
        let scope = BundleScope::new(node, None, Parent::new(listener), config.clone());
        let bundle = Arc::new(B::bind(&scope)?);
        tracing::debug!(bundle = %path.display(), "Opened bundle");

        let root = Self {
            bundle,
            shared,
            config,
        };
        // Files created from initial values during binding are not on disk yet.
        if root.shared.node.has_pending_changes() {
            root.shared.schedule_flush();
        }
        Ok(root)
    }

    pub fn bundle(&self) -> &Arc<B> {
        &self.bundle
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn node(&self) -> &Node {
        &self.shared.node
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Write the node tree to disk now, dropping any scheduled flush
    pub fn flush(&self) -> Result<FlushReport, SyncError> {
        self.shared.scheduler.cancel();
        self.shared.flush()
    }

    /// Push every pending value into the tree, then flush it
    pub fn commit(&self) -> Result<FlushReport, SyncError> {
        self.bundle.scope().commit()?;
        self.flush()
    }

    /// Notified synchronously after any change below the root, before the
    /// value is written and flushed
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.shared.observers.subscribe(callback)
    }

    /// Block until no flush is scheduled
    pub fn wait_idle(&self) {
        self.shared.scheduler.wait_idle();
    }

    /// Most recent background flush failure
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }
}

impl<B: FileBundle> Drop for BundleRoot<B> {
    fn drop(&mut self) {
        if self.bundle.scope().is_discarded() {
            return;
        }
        if let Err(e) = self.commit() {
            tracing::error!(bundle = %self.shared.path.display(), "Final flush failed: {}", e);
        }
    }
}
