//! In-memory filesystem nodes
//!
//! A [`Node`] is one entry of a bundle: either a regular file holding bytes or a
//! directory of uniquely named children. Nodes are shared handles; cloning a
//! `Node` clones the handle, not the entry. Mutations mark the node and every
//! ancestor dirty so the next flush writes only what changed.
//!
//! Each node remembers the name it was last persisted under. Removing a child
//! queues a deletion of that name; renaming a child keeps its handle and is
//! replayed as a filesystem rename on flush.

mod persist;

pub use persist::FlushReport;

use crate::error::NodeError;
use crate::storage::{EntryKind, Storage};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Shared handle to one filesystem entry
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    kind: EntryKind,
    state: RwLock<NodeState>,
    parent: RwLock<Weak<NodeInner>>,
    /// Set on the top node of a tree opened from disk
    origin: Option<Arc<TreeOrigin>>,
}

struct NodeState {
    name: String,
    /// Name of the on-disk entry, `None` until first flushed
    persisted_name: Option<String>,
    payload: Payload,
    dirty: bool,
    subtree_dirty: bool,
    revision: u64,
}

enum Payload {
    /// `None` until the bytes are first read from disk
    File(Option<Arc<[u8]>>),
    Directory {
        children: BTreeMap<String, Node>,
        /// Detached children whose on-disk entries are awaiting deletion
        removed: Vec<Node>,
    },
}

struct TreeOrigin {
    path: PathBuf,
    storage: Arc<dyn Storage>,
    ignored: Vec<String>,
    /// Serializes flushes and lazy loads
    io: Mutex<()>,
}

impl NodeState {
    fn directory_mut(
        &mut self,
    ) -> Result<(&mut BTreeMap<String, Node>, &mut Vec<Node>), NodeError> {
        match &mut self.payload {
            Payload::Directory { children, removed } => Ok((children, removed)),
            Payload::File(_) => Err(NodeError::NotADirectory {
                name: self.name.clone(),
            }),
        }
    }
}

impl Node {
    fn with_payload(kind: EntryKind, name: String, payload: Payload) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                kind,
                state: RwLock::new(NodeState {
                    name,
                    persisted_name: None,
                    payload,
                    dirty: true,
                    subtree_dirty: true,
                    revision: 0,
                }),
                parent: RwLock::new(Weak::new()),
                origin: None,
            }),
        }
    }

    /// Create a detached regular file
    pub fn file(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::with_payload(
            EntryKind::File,
            String::new(),
            Payload::File(Some(bytes.into())),
        )
    }

    /// Create a detached, empty directory
    pub fn directory() -> Self {
        Self::with_payload(
            EntryKind::Directory,
            String::new(),
            Payload::Directory {
                children: BTreeMap::new(),
                removed: Vec::new(),
            },
        )
    }

    fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub fn kind(&self) -> EntryKind {
        self.inner.kind
    }

    pub fn is_directory(&self) -> bool {
        self.inner.kind == EntryKind::Directory
    }

    /// Current name within the parent directory
    pub fn name(&self) -> String {
        self.inner.state.read().name.clone()
    }

    pub fn parent(&self) -> Option<Node> {
        self.inner.parent.read().upgrade().map(Node::from_inner)
    }

    /// True when both handles refer to the same entry
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of times the file contents were replaced
    pub fn revision(&self) -> u64 {
        self.inner.state.read().revision
    }

    /// True when the file has changes not yet flushed to disk
    pub fn is_dirty(&self) -> bool {
        let state = self.inner.state.read();
        state.dirty || state.persisted_name.is_none()
    }

    /// True when this node or anything below it awaits a flush
    pub fn has_pending_changes(&self) -> bool {
        let state = self.inner.state.read();
        state.dirty || state.subtree_dirty || state.persisted_name.is_none()
    }

    /// True once the file payload is in memory
    pub fn is_loaded(&self) -> bool {
        matches!(self.inner.state.read().payload, Payload::File(Some(_)))
    }

    fn wrong_kind(&self, expected: EntryKind) -> NodeError {
        NodeError::WrongKind {
            name: self.name(),
            expected: expected.as_str(),
            actual: self.kind().as_str(),
        }
    }

    /// Look up a direct child by name. Never creates.
    pub fn child(&self, name: &str) -> Option<Node> {
        match &self.inner.state.read().payload {
            Payload::Directory { children, .. } => children.get(name).cloned(),
            Payload::File(_) => None,
        }
    }

    /// Children in name order
    pub fn children(&self) -> Vec<(String, Node)> {
        match &self.inner.state.read().payload {
            Payload::Directory { children, .. } => children
                .iter()
                .map(|(name, node)| (name.clone(), node.clone()))
                .collect(),
            Payload::File(_) => Vec::new(),
        }
    }

    /// Insert `node` under `name`, replacing any existing entry with that name.
    ///
    /// A node that was removed from this same directory and not yet flushed is
    /// moved rather than recreated. Re-adding a current child under a new name
    /// renames it.
    pub fn add_child(&self, node: &Node, name: &str) -> Result<(), NodeError> {
        if !self.is_directory() {
            return Err(NodeError::NotADirectory { name: self.name() });
        }

        // Validate the incoming node before touching our own state.
        let current_parent = node.inner.parent.read().upgrade();
        let persisted = node.inner.state.read().persisted_name.is_some();
        let already_child = match &current_parent {
            Some(parent) if Arc::ptr_eq(parent, &self.inner) => true,
            Some(_) => return Err(NodeError::AlreadyAttached { name: node.name() }),
            None => false,
        };

        let displaced = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let (children, removed) = state.directory_mut()?;
            if already_child {
                children.retain(|_, existing| !existing.ptr_eq(node));
            } else if let Some(pos) = removed.iter().position(|r| r.ptr_eq(node)) {
                removed.swap_remove(pos);
            } else if persisted {
                return Err(NodeError::CrossDirectoryMove { name: node.name() });
            }
            let displaced = children.insert(name.to_string(), node.clone());
            let displaced = displaced.filter(|old| !old.ptr_eq(node));
            if let Some(old) = &displaced {
                if old.inner.state.read().persisted_name.is_some() {
                    removed.push(old.clone());
                }
            }
            state.subtree_dirty = true;
            displaced
        };

        if let Some(old) = displaced {
            *old.inner.parent.write() = Weak::new();
        }
        node.inner.state.write().name = name.to_string();
        *node.inner.parent.write() = Arc::downgrade(&self.inner);
        self.mark_ancestors_dirty();
        Ok(())
    }

    /// Remove a child by identity. Returns false when `node` is not a child.
    pub fn remove_child(&self, node: &Node) -> Result<bool, NodeError> {
        let removed_any = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let (children, removed) = state.directory_mut()?;
            let before = children.len();
            children.retain(|_, existing| !existing.ptr_eq(node));
            let removed_any = children.len() != before;
            if removed_any {
                if node.inner.state.read().persisted_name.is_some() {
                    removed.push(node.clone());
                }
                state.subtree_dirty = true;
            }
            removed_any
        };

        if removed_any {
            *node.inner.parent.write() = Weak::new();
            self.mark_ancestors_dirty();
        }
        Ok(removed_any)
    }

    /// Rename several children in one step.
    ///
    /// All renamed nodes leave their old names before any takes its new one, so
    /// two children may swap names. Entries displaced by a new name are removed.
    pub fn rename_children(&self, renames: &[(Node, String)]) -> Result<(), NodeError> {
        if renames.is_empty() {
            return Ok(());
        }
        let displaced = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let (children, removed) = state.directory_mut()?;
            for (node, _) in renames {
                if !children.values().any(|existing| existing.ptr_eq(node)) {
                    return Err(NodeError::Detached { name: node.name() });
                }
            }
            children.retain(|_, existing| !renames.iter().any(|(n, _)| n.ptr_eq(existing)));
            let mut displaced = Vec::new();
            for (node, new_name) in renames {
                if let Some(old) = children.insert(new_name.clone(), node.clone()) {
                    if old.inner.state.read().persisted_name.is_some() {
                        removed.push(old.clone());
                    }
                    displaced.push(old);
                }
            }
            state.subtree_dirty = true;
            displaced
        };

        for old in displaced {
            *old.inner.parent.write() = Weak::new();
        }
        for (node, new_name) in renames {
            node.inner.state.write().name = new_name.clone();
        }
        self.mark_ancestors_dirty();
        Ok(())
    }

    /// Bytes of a regular file, loading them from disk on first access
    pub fn regular_file_contents(&self) -> Result<Arc<[u8]>, NodeError> {
        if self.is_directory() {
            return Err(self.wrong_kind(EntryKind::File));
        }
        if let Payload::File(Some(bytes)) = &self.inner.state.read().payload {
            return Ok(bytes.clone());
        }
        self.load()
    }

    /// Replace the bytes of a regular file and mark it for writing
    pub fn set_regular_file_contents(&self, bytes: impl Into<Arc<[u8]>>) -> Result<(), NodeError> {
        if self.is_directory() {
            return Err(self.wrong_kind(EntryKind::File));
        }
        {
            let mut state = self.inner.state.write();
            state.payload = Payload::File(Some(bytes.into()));
            state.dirty = true;
            state.revision += 1;
        }
        self.mark_ancestors_dirty();
        Ok(())
    }

    fn load(&self) -> Result<Arc<[u8]>, NodeError> {
        let origin = self.origin().ok_or_else(|| NodeError::Detached { name: self.name() })?;
        let _io = origin.io.lock();

        // Another reader may have loaded it while we waited.
        if let Payload::File(Some(bytes)) = &self.inner.state.read().payload {
            return Ok(bytes.clone());
        }
        let path = self
            .persisted_path()
            .ok_or_else(|| NodeError::Detached { name: self.name() })?;
        tracing::debug!(path = %path.display(), "Loading file contents");
        let bytes: Arc<[u8]> = origin.storage.read(&path)?.into();

        let mut state = self.inner.state.write();
        match &state.payload {
            Payload::File(Some(existing)) => Ok(existing.clone()),
            _ => {
                state.payload = Payload::File(Some(bytes.clone()));
                Ok(bytes)
            }
        }
    }

    fn mark_ancestors_dirty(&self) {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            inner.state.write().subtree_dirty = true;
            current = inner.parent.read().upgrade();
        }
    }

    fn root_inner(&self) -> Arc<NodeInner> {
        let mut current = self.inner.clone();
        loop {
            let parent = current.parent.read().upgrade();
            match parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    fn origin(&self) -> Option<Arc<TreeOrigin>> {
        self.root_inner().origin.clone()
    }

    /// Path built from current names, `None` when not attached to an opened tree
    pub fn path(&self) -> Option<PathBuf> {
        self.build_path(|state| Some(state.name.clone()))
    }

    /// Path of the entry on disk as of the last flush
    pub fn persisted_path(&self) -> Option<PathBuf> {
        self.build_path(|state| state.persisted_name.clone())
    }

    fn build_path(&self, name_of: impl Fn(&NodeState) -> Option<String>) -> Option<PathBuf> {
        let mut segments = Vec::new();
        let mut current = self.inner.clone();
        loop {
            if let Some(origin) = &current.origin {
                let mut path = origin.path.clone();
                for segment in segments.iter().rev() {
                    path.push(segment);
                }
                return Some(path);
            }
            segments.push(name_of(&current.state.read())?);
            let parent = current.parent.read().upgrade()?;
            current = parent;
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Node")
            .field("name", &state.name)
            .field("kind", &self.inner.kind)
            .field("persisted_name", &state.persisted_name)
            .field("dirty", &state.dirty)
            .finish()
    }
}
