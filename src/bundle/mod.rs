//! File bundles
//!
//! A bundle is a typed view over one directory. Each bundle type declares its
//! properties in [`FileBundle::bind`] through a [`BundleScope`]: single-value
//! files, keyed folders of files, nested bundles and keyed folders of nested
//! bundles. The scope wires every declared property to its node and routes
//! change notifications upward.

mod root;

pub use root::BundleRoot;

use crate::config::SyncConfig;
use crate::coordinator::{CoordinatorOptions, FileCoordinator, FileProperty};
use crate::error::{BundleError, SyncError};
use crate::node::Node;
use crate::registry::{
    BundleChildFactory, ChildFactory, ChildrenProperty, FileChildFactory, KeyedRegistry,
};
use crate::relay::{ChangeListener, Observers, Parent, Subscription};
use crate::storage::EntryKind;
use crate::types::Identifiable;
use parking_lot::{Mutex, RwLock};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Something that can be flushed synchronously or shut down for good
pub trait Committable: Send + Sync {
    /// Write pending values into their nodes now
    fn commit(&self) -> Result<(), SyncError>;
    /// Stop all further writes
    fn discard(&self);
}

/// A typed directory
pub trait FileBundle: Send + Sync + Sized + 'static {
    /// Declare every property of the bundle on `scope`
    fn bind(scope: &BundleScope) -> Result<Self, SyncError>;

    fn scope(&self) -> &BundleScope;
}

/// Bundle without declared properties, for ad hoc access
pub struct DynamicBundle {
    scope: BundleScope,
}

impl FileBundle for DynamicBundle {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

struct BundleObject {
    me: Weak<BundleObject>,
    node: Node,
    key: RwLock<Option<String>>,
    parent: RwLock<Parent>,
    config: Arc<SyncConfig>,
    members: Mutex<Vec<Arc<dyn Committable>>>,
    observers: Observers,
    attached: AtomicBool,
    discarded: AtomicBool,
}

impl ChangeListener for BundleObject {
    fn child_did_update(&self) {
        self.observers.notify();
        let parent = self.parent.read().clone();
        parent.notify();
    }

    fn child_did_write(&self) {
        let parent = self.parent.read().clone();
        parent.notify_write();
    }
}

/// Binding context of one bundle directory
#[derive(Clone)]
pub struct BundleScope {
    object: Arc<BundleObject>,
}

impl BundleScope {
    pub(crate) fn new(
        node: Node,
        key: Option<String>,
        parent: Parent,
        config: Arc<SyncConfig>,
    ) -> Self {
        let attached = parent.is_set();
        Self {
            object: Arc::new_cyclic(|me| BundleObject {
                me: me.clone(),
                node,
                key: RwLock::new(key),
                parent: RwLock::new(parent),
                config,
                members: Mutex::new(Vec::new()),
                observers: Observers::new(),
                attached: AtomicBool::new(attached),
                discarded: AtomicBool::new(false),
            }),
        }
    }

    /// Build a bundle that lives only in memory until it is inserted into a
    /// bundle registry.
    pub fn detached<C: FileBundle>(
        key: Option<String>,
        config: Arc<SyncConfig>,
    ) -> Result<Arc<C>, SyncError> {
        let scope = BundleScope::new(Node::directory(), key, Parent::none(), config);
        Ok(Arc::new(C::bind(&scope)?))
    }

    pub fn node(&self) -> &Node {
        &self.object.node
    }

    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.object.config
    }

    /// Key of this bundle within its parent registry
    pub fn key(&self) -> Option<String> {
        self.object.key.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.object.attached.load(Ordering::SeqCst)
    }

    /// Connect a detached bundle to its new owner. Fails when already attached.
    pub(crate) fn attach(&self, key: String, parent: Parent) -> Result<(), BundleError> {
        if self.object.attached.swap(true, Ordering::SeqCst) {
            return Err(BundleError::AlreadyAttached(key));
        }
        *self.object.key.write() = Some(key);
        *self.object.parent.write() = parent;
        Ok(())
    }

    pub(crate) fn set_parent(&self, parent: Parent) {
        *self.object.parent.write() = parent;
    }

    pub fn ptr_eq(&self, other: &BundleScope) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.object.observers.subscribe(callback)
    }

    fn as_parent(&self) -> Parent {
        let me: Weak<dyn ChangeListener> = self.object.me.clone();
        Parent::new(me)
    }

    fn register(&self, member: Arc<dyn Committable>) {
        self.object.members.lock().push(member);
    }

    fn label(&self, relative: &Path) -> String {
        let base = self
            .object
            .node
            .path()
            .unwrap_or_else(|| PathBuf::from(self.key().unwrap_or_default()));
        base.join(relative).display().to_string()
    }

    /// Walk `path` below the bundle directory, creating missing intermediate
    /// directories. Returns the parent directory and the final name.
    fn parent_for(&self, path: &Path) -> Result<(Node, String), SyncError> {
        let mut names = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => names.push(name.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(BundleError::InvalidKey(path.display().to_string()).into());
                }
            }
        }
        let Some(last) = names.pop() else {
            return Err(BundleError::InvalidKey(path.display().to_string()).into());
        };

        let mut dir = self.object.node.clone();
        for name in names {
            dir = match dir.child(&name) {
                Some(existing) if existing.is_directory() => existing,
                Some(existing) => {
                    return Err(BundleError::KindMismatch {
                        path: name,
                        expected: EntryKind::Directory.as_str(),
                        actual: existing.kind().as_str(),
                    }
                    .into())
                }
                None => {
                    let created = Node::directory();
                    dir.add_child(&created, &name)?;
                    self.object.child_did_write();
                    created
                }
            };
        }
        Ok((dir, last))
    }

    fn directory_at(&self, path: &Path) -> Result<(Node, String), SyncError> {
        let (parent, name) = self.parent_for(path)?;
        match parent.child(&name) {
            Some(existing) if existing.is_directory() => Ok((existing, name)),
            Some(existing) => Err(BundleError::KindMismatch {
                path: path.display().to_string(),
                expected: EntryKind::Directory.as_str(),
                actual: existing.kind().as_str(),
            }
            .into()),
            None => {
                let created = Node::directory();
                parent.add_child(&created, &name)?;
                self.object.child_did_write();
                Ok((created, name))
            }
        }
    }

    /// Bind a single-value file. A missing file is created from the initial value.
    pub fn file<T>(&self, property: FileProperty<T>) -> Result<Arc<FileCoordinator<T>>, SyncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let config = &self.object.config;
        let label = self.label(&property.path);
        let key = property
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let mut context = config.coding_context();
        context.key = key;
        let options = CoordinatorOptions {
            label: label.clone(),
            coder: property.coder.clone(),
            context: context.clone(),
            initial: property.initial.clone(),
            recovery: property.recovery.unwrap_or(config.recovery),
            write_delay: config.write_delay(),
            eager_read: config.eager_read,
            observe: property.observe.clone(),
        };

        let (dir, name) = self.parent_for(&property.path)?;
        let coordinator = match dir.child(&name) {
            Some(node) if !node.is_directory() => {
                FileCoordinator::new(node, self.as_parent(), options)
            }
            Some(node) => {
                return Err(BundleError::KindMismatch {
                    path: label,
                    expected: EntryKind::File.as_str(),
                    actual: node.kind().as_str(),
                }
                .into())
            }
            None => {
                let initial = property
                    .initial
                    .as_ref()
                    .ok_or_else(|| BundleError::MissingInitialValue(label.clone()))?;
                let value = initial();
                let node = Node::file(property.coder.encode(&value, &context)?);
                dir.add_child(&node, &name)?;
                tracing::debug!(file = %label, "Created file from initial value");
                let coordinator =
                    FileCoordinator::with_value(node, self.as_parent(), options, value);
                self.object.child_did_write();
                coordinator
            }
        };
        self.register(coordinator.clone());
        Ok(coordinator)
    }

    /// Bind a keyed folder of files
    pub fn children<T>(
        &self,
        property: ChildrenProperty<T>,
    ) -> Result<Arc<KeyedRegistry<T>>, SyncError>
    where
        T: Identifiable + PartialEq + Clone + Send + Sync + 'static,
    {
        let (dir, _) = self.directory_at(&property.path)?;
        let factory: Arc<dyn ChildFactory<T>> =
            Arc::new(FileChildFactory::from_property(&property));
        let registry =
            KeyedRegistry::new(dir, self.as_parent(), factory, self.object.config.clone())?;
        self.register(registry.clone());
        Ok(registry)
    }

    /// Bind a nested bundle stored in the directory at `path`
    pub fn bundle<C: FileBundle>(&self, path: impl AsRef<Path>) -> Result<Arc<C>, SyncError> {
        let (dir, name) = self.directory_at(path.as_ref())?;
        let scope = BundleScope::new(dir, Some(name), self.as_parent(), self.object.config.clone());
        let bundle = Arc::new(C::bind(&scope)?);
        self.register(Arc::new(scope));
        Ok(bundle)
    }

    /// Bind a keyed folder of nested bundles
    pub fn bundles<C>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<KeyedRegistry<Arc<C>>>, SyncError>
    where
        C: FileBundle + Identifiable,
    {
        let (dir, _) = self.directory_at(path.as_ref())?;
        let factory: Arc<dyn ChildFactory<Arc<C>>> = Arc::new(BundleChildFactory::<C>::new());
        let registry =
            KeyedRegistry::new(dir, self.as_parent(), factory, self.object.config.clone())?;
        self.register(registry.clone());
        Ok(registry)
    }

    /// Remove the entry at `path`. Returns false when nothing is there.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<bool, SyncError> {
        let Some(node) = self.entry(path.as_ref()) else {
            return Ok(false);
        };
        if node.ptr_eq(&self.object.node) {
            return Err(BundleError::InvalidKey(path.as_ref().display().to_string()).into());
        }
        let Some(dir) = node.parent() else {
            return Ok(false);
        };
        let removed = dir.remove_child(&node)?;
        if removed {
            self.object.child_did_update();
        }
        Ok(removed)
    }

    /// Node at `path` below the bundle directory, if any
    pub fn entry(&self, path: impl AsRef<Path>) -> Option<Node> {
        let mut current = self.object.node.clone();
        for component in path.as_ref().components() {
            match component {
                Component::Normal(name) => current = current.child(&name.to_string_lossy())?,
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    /// Write every pending value of this bundle into the tree now
    pub fn commit(&self) -> Result<(), SyncError> {
        let members: Vec<_> = self.object.members.lock().clone();
        for member in members {
            member.commit()?;
        }
        Ok(())
    }

    /// Stop all writes of this bundle and everything bound in it
    pub fn discard(&self) {
        self.object.discarded.store(true, Ordering::SeqCst);
        let members: Vec<_> = self.object.members.lock().clone();
        for member in members {
            member.discard();
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.object.discarded.load(Ordering::SeqCst)
    }
}

impl Committable for BundleScope {
    fn commit(&self) -> Result<(), SyncError> {
        BundleScope::commit(self)
    }

    fn discard(&self) {
        BundleScope::discard(self)
    }
}
