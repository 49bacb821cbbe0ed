//! Loading node trees from storage and flushing them back

use super::{Node, NodeInner, NodeState, Payload, TreeOrigin};
use crate::error::NodeError;
use crate::storage::{EntryKind, Storage};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

const MOVE_PREFIX: &str = ".filebundle-move";

/// Filesystem operations performed by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub removed: usize,
    pub renamed: usize,
    pub created_dirs: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        *self == FlushReport::default()
    }
}

impl Node {
    /// Build the tree rooted at the existing directory `path`.
    ///
    /// File payloads are not read; they load on first access. Entries named in
    /// `ignored` are skipped along with everything beneath them.
    pub fn open(
        storage: Arc<dyn Storage>,
        path: &Path,
        ignored: Vec<String>,
    ) -> Result<Node, NodeError> {
        let entries = storage.walk(path)?;
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let origin = Arc::new(TreeOrigin {
            path: path.to_path_buf(),
            storage,
            ignored,
            io: Mutex::new(()),
        });
        let root = Node {
            inner: Arc::new(NodeInner {
                kind: EntryKind::Directory,
                state: RwLock::new(NodeState {
                    name: root_name.clone(),
                    persisted_name: Some(root_name),
                    payload: Payload::Directory {
                        children: BTreeMap::new(),
                        removed: Vec::new(),
                    },
                    dirty: false,
                    subtree_dirty: false,
                    revision: 0,
                }),
                parent: RwLock::new(Weak::new()),
                origin: Some(origin.clone()),
            }),
        };

        let mut directories: HashMap<PathBuf, Node> = HashMap::new();
        let mut loaded = 0usize;
        for entry in entries {
            let skipped = entry.relative_path.components().any(|c| {
                let name = c.as_os_str().to_string_lossy();
                origin.ignored.iter().any(|ignored| *ignored == name)
            });
            if skipped {
                continue;
            }
            let Some(name) = entry
                .relative_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            let parent = match entry.relative_path.parent() {
                Some(p) if !p.as_os_str().is_empty() => match directories.get(p) {
                    Some(dir) => dir.clone(),
                    None => continue,
                },
                _ => root.clone(),
            };

            let payload = match entry.kind {
                EntryKind::File => Payload::File(None),
                EntryKind::Directory => Payload::Directory {
                    children: BTreeMap::new(),
                    removed: Vec::new(),
                },
            };
            let node = Node::with_payload(entry.kind, name.clone(), payload);
            {
                let mut state = node.inner.state.write();
                state.persisted_name = Some(name.clone());
                state.dirty = false;
                state.subtree_dirty = false;
            }
            *node.inner.parent.write() = Arc::downgrade(&parent.inner);
            if let Payload::Directory { children, .. } = &mut parent.inner.state.write().payload {
                children.insert(name, node.clone());
            }
            if entry.kind == EntryKind::Directory {
                directories.insert(entry.relative_path.clone(), node);
            }
            loaded += 1;
        }

        tracing::debug!(path = %path.display(), entries = loaded, "Opened node tree");
        Ok(root)
    }

    /// Write every pending change of this tree to storage.
    ///
    /// Must be called on the top node of an opened tree.
    pub fn flush(&self) -> Result<FlushReport, NodeError> {
        let origin = self
            .inner
            .origin
            .clone()
            .ok_or_else(|| NodeError::Detached { name: self.name() })?;
        let _io = origin.io.lock();

        let mut report = FlushReport::default();
        flush_directory(&origin, self, &origin.path, false, &mut report)?;
        if !report.is_empty() {
            tracing::debug!(
                path = %origin.path.display(),
                written = report.written,
                removed = report.removed,
                renamed = report.renamed,
                created_dirs = report.created_dirs,
                "Flushed node tree"
            );
        }
        Ok(report)
    }
}

fn flush_directory(
    origin: &TreeOrigin,
    dir: &Node,
    path: &Path,
    force: bool,
    report: &mut FlushReport,
) -> Result<(), NodeError> {
    // Clear the flag before looking at children so that changes racing with
    // this flush mark the directory again.
    let (children, removed) = {
        let mut state = dir.inner.state.write();
        if !state.subtree_dirty && !force {
            return Ok(());
        }
        state.subtree_dirty = false;
        let Payload::Directory { children, removed } = &mut state.payload else {
            return Ok(());
        };
        let snapshot: Vec<Node> = children.values().cloned().collect();
        (snapshot, std::mem::take(removed))
    };

    let result = flush_entries(origin, path, &children, removed, report);
    if result.is_err() {
        dir.mark_ancestors_dirty();
    }
    result
}

fn flush_entries(
    origin: &TreeOrigin,
    path: &Path,
    children: &[Node],
    removed: Vec<Node>,
    report: &mut FlushReport,
) -> Result<(), NodeError> {
    let storage = &origin.storage;
    let is_ignored = |name: &str| origin.ignored.iter().any(|ignored| ignored == name);

    for node in &removed {
        let persisted = node.inner.state.read().persisted_name.clone();
        if let Some(persisted) = persisted {
            storage.remove(&path.join(&persisted))?;
            node.inner.state.write().persisted_name = None;
            report.removed += 1;
        }
    }

    // Two-phase renames: every moved entry steps aside to a temporary name
    // first, so names can be exchanged freely.
    let renamed: Vec<(&Node, String)> = children
        .iter()
        .filter_map(|node| {
            let state = node.inner.state.read();
            match &state.persisted_name {
                Some(persisted) if *persisted != state.name => Some((node, persisted.clone())),
                _ => None,
            }
        })
        .collect();
    let mut staged = Vec::with_capacity(renamed.len());
    for (index, (node, persisted)) in renamed.iter().enumerate() {
        let temp = format!("{}-{}-{}", MOVE_PREFIX, index, persisted);
        storage.rename(&path.join(persisted), &path.join(&temp))?;
        node.inner.state.write().persisted_name = Some(temp.clone());
        staged.push((*node, temp));
    }
    for (node, temp) in staged {
        let name = node.name();
        storage.rename(&path.join(&temp), &path.join(&name))?;
        node.inner.state.write().persisted_name = Some(name);
        report.renamed += 1;
    }

    for node in children {
        let name = node.name();
        if is_ignored(&name) {
            tracing::debug!(name = %name, "Skipping ignored entry");
            continue;
        }
        let target = path.join(&name);
        match node.kind() {
            EntryKind::Directory => {
                let is_new = node.inner.state.read().persisted_name.is_none();
                if is_new {
                    storage.create_dir_all(&target)?;
                    node.inner.state.write().persisted_name = Some(name);
                    report.created_dirs += 1;
                }
                flush_directory(origin, node, &target, is_new, report)?;
            }
            EntryKind::File => flush_file(origin, node, &target, name, report)?,
        }
    }
    Ok(())
}

fn flush_file(
    origin: &TreeOrigin,
    node: &Node,
    target: &Path,
    name: String,
    report: &mut FlushReport,
) -> Result<(), NodeError> {
    let bytes = {
        let mut state = node.inner.state.write();
        if !state.dirty && state.persisted_name.is_some() {
            return Ok(());
        }
        match &state.payload {
            Payload::File(Some(bytes)) => {
                let bytes = bytes.clone();
                state.dirty = false;
                bytes
            }
            _ => {
                tracing::warn!(path = %target.display(), "File has no contents to write, skipping");
                return Ok(());
            }
        }
    };

    if let Err(e) = origin.storage.write_atomic(target, &bytes) {
        node.inner.state.write().dirty = true;
        return Err(e.into());
    }
    node.inner.state.write().persisted_name = Some(name);
    report.written += 1;
    Ok(())
}
