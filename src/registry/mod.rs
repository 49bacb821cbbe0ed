//! Keyed child registry
//!
//! A [`KeyedRegistry`] maps the entries of one directory to typed children,
//! one child per key. The entry name is the key (plus an optional extension).
//! [`KeyedRegistry::set_contents`] reconciles the directory against a new
//! collection with as few filesystem operations as possible, moving children
//! whose values were only re-keyed instead of recreating them.

pub mod bundle;
pub mod diff;
pub mod file;

pub use bundle::BundleChildFactory;
pub use file::{ChildrenProperty, FileChildFactory};

use crate::bundle::Committable;
use crate::collection::IdentifierIndexingArray;
use crate::config::SyncConfig;
use crate::error::{BundleError, SyncError};
use crate::node::Node;
use crate::relay::{ChangeListener, Observers, Parent, Subscription};
use crate::storage::EntryKind;
use crate::types::{Fingerprint, Identifiable, StringRepresentable};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Contents of a keyed folder
pub type Contents<T> = IdentifierIndexingArray<T, <T as Identifiable>::Id>;

/// One live child of a registry
pub trait KeyedChild<T>: Send + Sync {
    fn node(&self) -> Node;
    fn contents(&self) -> Result<T, SyncError>;
    /// Route a new value through the child's normal write path
    fn set_contents(&self, value: T) -> Result<(), SyncError>;
    /// Take `value` after a rename; the on-disk payload already matches it
    fn adopt(&self, value: T);
    /// The child's entry now lives under `key`
    fn did_rename(&self, _key: &str) {}
    fn set_parent(&self, parent: Parent);
    fn commit(&self) -> Result<(), SyncError>;
    fn discard(&self);
}

/// Context handed to factories
#[derive(Clone)]
pub struct ChildContext {
    pub config: Arc<SyncConfig>,
    pub parent: Parent,
    /// Display path of the registry directory, for logs
    pub label: String,
}

/// Creates and recognises the children of one registry
pub trait ChildFactory<T>: Send + Sync {
    fn kind(&self) -> EntryKind;
    fn file_name(&self, key: &str) -> String;
    /// Key encoded in an entry name, `None` for unrelated entries
    fn key_for(&self, file_name: &str) -> Option<String>;
    fn load(
        &self,
        cx: &ChildContext,
        key: &str,
        node: Node,
    ) -> Result<Arc<dyn KeyedChild<T>>, SyncError>;
    fn create(
        &self,
        cx: &ChildContext,
        key: &str,
        value: &T,
    ) -> Result<(Node, Arc<dyn KeyedChild<T>>), SyncError>;
    fn fingerprint(&self, cx: &ChildContext, value: &T) -> Option<Fingerprint>;
    fn same_value(&self, a: &T, b: &T) -> bool;
}

/// Filesystem changes made by one reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    pub inserted: usize,
    pub renamed: usize,
    pub updated: usize,
}

struct RegistryState<T: Identifiable> {
    loaded: bool,
    order: Vec<T::Id>,
    children: HashMap<T::Id, Arc<dyn KeyedChild<T>>>,
}

/// Keyed collection of children stored in one directory
pub struct KeyedRegistry<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    me: Weak<Self>,
    label: String,
    directory: Node,
    parent: RwLock<Parent>,
    factory: Arc<dyn ChildFactory<T>>,
    config: Arc<SyncConfig>,
    state: Mutex<RegistryState<T>>,
    batch_depth: AtomicUsize,
    suppressed: AtomicBool,
    discarded: AtomicBool,
    observers: Observers,
}

struct BatchGuard<'a, T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    registry: &'a KeyedRegistry<T>,
}

impl<'a, T> BatchGuard<'a, T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    fn new(registry: &'a KeyedRegistry<T>) -> Self {
        registry.batch_depth.fetch_add(1, Ordering::SeqCst);
        Self { registry }
    }
}

impl<T> Drop for BatchGuard<'_, T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.batch_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> KeyedRegistry<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        directory: Node,
        parent: Parent,
        factory: Arc<dyn ChildFactory<T>>,
        config: Arc<SyncConfig>,
    ) -> Result<Arc<Self>, SyncError> {
        if !directory.is_directory() {
            return Err(BundleError::KindMismatch {
                path: directory.name(),
                expected: EntryKind::Directory.as_str(),
                actual: directory.kind().as_str(),
            }
            .into());
        }
        let label = directory
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| directory.name());
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            label,
            directory,
            parent: RwLock::new(parent),
            factory,
            config,
            state: Mutex::new(RegistryState {
                loaded: false,
                order: Vec::new(),
                children: HashMap::new(),
            }),
            batch_depth: AtomicUsize::new(0),
            suppressed: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            observers: Observers::new(),
        }))
    }

    pub fn directory(&self) -> &Node {
        &self.directory
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    pub(crate) fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    fn child_context(&self) -> ChildContext {
        let me: Weak<dyn ChangeListener> = self.me.clone();
        ChildContext {
            config: self.config.clone(),
            parent: Parent::new(me),
            label: self.label.clone(),
        }
    }

    fn validate_key(&self, key: &str) -> Result<(), BundleError> {
        let invalid = key.is_empty()
            || key == "."
            || key == ".."
            || key.contains('/')
            || key.contains('\\')
            || self.config.is_ignored(key)
            || self.config.is_ignored(&self.factory.file_name(key));
        if invalid {
            Err(BundleError::InvalidKey(key.to_string()))
        } else {
            Ok(())
        }
    }

    /// Lock the state, loading the children on first use. Children may
    /// announce changes while they bind; those are held back until the lock
    /// is released.
    fn lock_loaded(&self) -> MutexGuard<'_, RegistryState<T>> {
        let mut state = self.state.lock();
        if !state.loaded {
            let batch = BatchGuard::new(self);
            self.load_children(&mut state);
            drop(batch);
            if self.batch_depth.load(Ordering::SeqCst) == 0
                && self.suppressed.swap(false, Ordering::SeqCst)
            {
                MutexGuard::unlocked(&mut state, || self.notify_changed());
            }
        }
        state
    }

    fn load_children(&self, state: &mut RegistryState<T>) {
        state.loaded = true;
        let cx = self.child_context();
        for (name, node) in self.directory.children() {
            if node.kind() != self.factory.kind() {
                continue;
            }
            let Some(key) = self.factory.key_for(&name) else {
                continue;
            };
            let Some(id) = T::Id::from_key_string(&key) else {
                tracing::warn!(
                    registry = %self.label,
                    entry = %name,
                    "Skipping entry with unparsable key"
                );
                continue;
            };
            if state.children.contains_key(&id) {
                tracing::warn!(registry = %self.label, entry = %name, "Skipping duplicate key");
                continue;
            }
            let child = match self.factory.load(&cx, &key, node) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(
                        registry = %self.label,
                        entry = %name,
                        "Skipping unreadable entry: {}",
                        e
                    );
                    continue;
                }
            };
            match child.contents() {
                Ok(value) if value.id() == id => {}
                Ok(value) => {
                    tracing::warn!(
                        registry = %self.label,
                        entry = %name,
                        "Skipping entry whose value identifies as {:?}",
                        value.id()
                    );
                    child.discard();
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        registry = %self.label,
                        entry = %name,
                        "Skipping unreadable entry: {}",
                        e
                    );
                    child.discard();
                    continue;
                }
            }
            state.order.push(id.clone());
            state.children.insert(id, child);
        }
        tracing::debug!(registry = %self.label, children = state.order.len(), "Loaded registry");
    }

    fn snapshot(&self) -> Vec<(T::Id, Arc<dyn KeyedChild<T>>)> {
        let state = self.lock_loaded();
        let children = state
            .order
            .iter()
            .filter_map(|id| state.children.get(id).map(|c| (id.clone(), c.clone())))
            .collect();
        children
    }

    /// Current values in registry order
    pub fn contents(&self) -> Result<Contents<T>, SyncError> {
        let mut contents = Contents::<T>::new();
        for (id, child) in self.snapshot() {
            contents.upsert(Self::value_of(&id, &child)?);
        }
        Ok(contents)
    }

    /// Value of the child stored under `id`. A value that now identifies
    /// under another id no longer matches its entry.
    fn value_of(id: &T::Id, child: &Arc<dyn KeyedChild<T>>) -> Result<T, SyncError> {
        let value = child.contents()?;
        let actual = value.id();
        if actual != *id {
            return Err(BundleError::IdMismatch {
                key: id.to_key_string(),
                id: actual.to_key_string(),
            }
            .into());
        }
        Ok(value)
    }

    pub fn ids(&self) -> Vec<T::Id> {
        self.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.child(id).is_some()
    }

    pub fn child(&self, id: &T::Id) -> Option<Arc<dyn KeyedChild<T>>> {
        self.lock_loaded().children.get(id).cloned()
    }

    pub fn get(&self, id: &T::Id) -> Result<Option<T>, SyncError> {
        self.child(id)
            .map(|child| Self::value_of(id, &child))
            .transpose()
    }

    /// Add or replace one value
    pub fn insert(&self, value: T) -> Result<ReconcileReport, SyncError> {
        let mut contents = self.contents()?;
        contents.upsert(value);
        self.set_contents(contents)
    }

    /// Remove one value, deleting its entry
    pub fn remove(&self, id: &T::Id) -> Result<Option<T>, SyncError> {
        let mut contents = self.contents()?;
        let removed = contents.remove(id);
        if removed.is_some() {
            self.set_contents(contents)?;
        }
        Ok(removed)
    }

    /// Reconcile the directory against `target`.
    ///
    /// Deletes children whose ids vanished, creates children for new ids,
    /// moves children whose value reappeared under a new id, and routes
    /// changed values of retained ids through their children. Observers and
    /// the parent hear about it exactly once.
    pub fn set_contents(&self, target: Contents<T>) -> Result<ReconcileReport, SyncError> {
        if self.discarded.load(Ordering::SeqCst) {
            tracing::debug!(registry = %self.label, "Ignoring update of discarded registry");
            return Ok(ReconcileReport::default());
        }
        for id in target.ids() {
            self.validate_key(&id.to_key_string())?;
        }

        let batch = BatchGuard::new(self);
        let result = self.reconcile(&target);
        drop(batch);
        self.suppressed.store(false, Ordering::SeqCst);
        self.notify_changed();

        let report = result?;
        tracing::debug!(
            registry = %self.label,
            removed = report.removed,
            inserted = report.inserted,
            renamed = report.renamed,
            updated = report.updated,
            "Reconciled registry"
        );
        Ok(report)
    }

    fn reconcile(&self, target: &Contents<T>) -> Result<ReconcileReport, SyncError> {
        let cx = self.child_context();
        let mut report = ReconcileReport::default();

        let mut state = self.lock_loaded();
        let mut current = Contents::<T>::new();
        for id in &state.order {
            if let Some(child) = state.children.get(id) {
                current.upsert(Self::value_of(id, child)?);
            }
        }

        let difference = target.difference(&current);
        let plan = diff::plan(
            &difference,
            |id| {
                current
                    .get(id)
                    .and_then(|value| self.factory.fingerprint(&cx, value))
            },
            |id| {
                target
                    .get(id)
                    .and_then(|value| self.factory.fingerprint(&cx, value))
            },
            self.config.rename_detection,
        );

        let applied = self.apply_plan(&cx, &mut state, &plan, target, &mut report);
        // Keep the order consistent with the children we actually hold.
        match &applied {
            Ok(()) => state.order = target.ids(),
            Err(_) => {
                let RegistryState {
                    order, children, ..
                } = &mut *state;
                order.retain(|id| children.contains_key(id));
                for id in target.ids() {
                    if children.contains_key(&id) && !order.contains(&id) {
                        order.push(id);
                    }
                }
            }
        }
        let renamed: Vec<_> = plan
            .renamed
            .iter()
            .filter_map(|(_, new)| state.children.get(new).map(|c| (new.clone(), c.clone())))
            .collect();
        let retained: Vec<_> = target
            .retained(&current)
            .into_iter()
            .filter_map(|id| state.children.get(&id).map(|c| (id, c.clone())))
            .collect();
        drop(state);
        applied?;

        for (id, child) in renamed {
            if let Some(value) = target.get(&id) {
                child.adopt(value.clone());
            }
        }
        for (id, child) in retained {
            let (Some(old), Some(new)) = (current.get(&id), target.get(&id)) else {
                continue;
            };
            if !self.factory.same_value(old, new) {
                child.set_contents(new.clone())?;
                report.updated += 1;
            }
        }
        Ok(report)
    }

    fn apply_plan(
        &self,
        cx: &ChildContext,
        state: &mut RegistryState<T>,
        plan: &diff::ReconcilePlan<T::Id>,
        target: &Contents<T>,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        for id in &plan.deleted {
            if let Some(child) = state.children.remove(id) {
                child.discard();
                self.directory.remove_child(&child.node())?;
                report.removed += 1;
            }
        }

        let mut moves = Vec::with_capacity(plan.renamed.len());
        let mut moved = Vec::with_capacity(plan.renamed.len());
        for (old, new) in &plan.renamed {
            if let Some(child) = state.children.remove(old) {
                let key = new.to_key_string();
                moves.push((child.node(), self.factory.file_name(&key)));
                moved.push((new.clone(), key, child));
            }
        }
        self.directory.rename_children(&moves)?;
        for (id, key, child) in moved {
            child.did_rename(&key);
            state.children.insert(id, child);
            report.renamed += 1;
        }

        for id in &plan.created {
            let Some(value) = target.get(id) else {
                continue;
            };
            let key = id.to_key_string();
            let (node, child) = self.factory.create(cx, &key, value)?;
            self.directory.add_child(&node, &self.factory.file_name(&key))?;
            state.children.insert(id.clone(), child);
            report.inserted += 1;
        }
        Ok(())
    }

    fn notify_changed(&self) {
        self.observers.notify();
        let parent = self.parent.read().clone();
        parent.notify();
    }

    pub(crate) fn set_parent(&self, parent: Parent) {
        *self.parent.write() = parent;
    }
}

impl<T> ChangeListener for KeyedRegistry<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    fn child_did_update(&self) {
        if self.batch_depth.load(Ordering::SeqCst) > 0 {
            self.suppressed.store(true, Ordering::SeqCst);
            return;
        }
        self.notify_changed();
    }

    fn child_did_write(&self) {
        let parent = self.parent.read().clone();
        parent.notify_write();
    }
}

impl<T> Committable for KeyedRegistry<T>
where
    T: Identifiable + Clone + Send + Sync + 'static,
{
    fn commit(&self) -> Result<(), SyncError> {
        let children: Vec<_> = self.state.lock().children.values().cloned().collect();
        for child in children {
            child.commit()?;
        }
        Ok(())
    }

    fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
        let children: Vec<_> = self.state.lock().children.values().cloned().collect();
        for child in children {
            child.discard();
        }
    }
}
