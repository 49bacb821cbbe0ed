//! Registries of nested bundles
//!
//! Each child is a directory bound to a bundle type. A bundle's id is the key
//! it was created or loaded under, so a live bundle is never re-keyed: a new
//! id is a new directory. Bundles are compared by instance, and a different
//! instance under an existing key cannot replace the live one.

use super::{ChildContext, ChildFactory, KeyedChild, KeyedRegistry};
use crate::bundle::{BundleScope, FileBundle};
use crate::error::{BundleError, SyncError};
use crate::node::Node;
use crate::relay::Parent;
use crate::storage::EntryKind;
use crate::types::{Fingerprint, Identifiable, StringRepresentable};
use std::marker::PhantomData;
use std::sync::Arc;

/// Binds the directories of a keyed folder to bundles of type `C`
pub struct BundleChildFactory<C> {
    _bundle: PhantomData<fn() -> C>,
}

impl<C> BundleChildFactory<C> {
    pub fn new() -> Self {
        Self {
            _bundle: PhantomData,
        }
    }
}

impl<C> Default for BundleChildFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

struct BundleChild<C: FileBundle> {
    bundle: Arc<C>,
}

impl<C> KeyedChild<Arc<C>> for BundleChild<C>
where
    C: FileBundle,
{
    fn node(&self) -> Node {
        self.bundle.scope().node().clone()
    }

    fn contents(&self) -> Result<Arc<C>, SyncError> {
        Ok(self.bundle.clone())
    }

    fn set_contents(&self, value: Arc<C>) -> Result<(), SyncError> {
        if Arc::ptr_eq(&self.bundle, &value) {
            return Ok(());
        }
        Err(BundleError::Reinitialize(self.bundle.scope().key().unwrap_or_default()).into())
    }

    fn adopt(&self, _value: Arc<C>) {}

    fn set_parent(&self, parent: Parent) {
        self.bundle.scope().set_parent(parent);
    }

    fn commit(&self) -> Result<(), SyncError> {
        self.bundle.scope().commit()
    }

    fn discard(&self) {
        self.bundle.scope().discard();
    }
}

impl<C> ChildFactory<Arc<C>> for BundleChildFactory<C>
where
    C: FileBundle + Identifiable,
{
    fn kind(&self) -> EntryKind {
        EntryKind::Directory
    }

    fn file_name(&self, key: &str) -> String {
        key.to_string()
    }

    fn key_for(&self, file_name: &str) -> Option<String> {
        Some(file_name.to_string())
    }

    fn load(
        &self,
        cx: &ChildContext,
        key: &str,
        node: Node,
    ) -> Result<Arc<dyn KeyedChild<Arc<C>>>, SyncError> {
        let scope = BundleScope::new(
            node,
            Some(key.to_string()),
            cx.parent.clone(),
            cx.config.clone(),
        );
        let bundle = Arc::new(C::bind(&scope)?);
        let child: Arc<dyn KeyedChild<Arc<C>>> = Arc::new(BundleChild { bundle });
        Ok(child)
    }

    fn create(
        &self,
        cx: &ChildContext,
        key: &str,
        value: &Arc<C>,
    ) -> Result<(Node, Arc<dyn KeyedChild<Arc<C>>>), SyncError> {
        let scope = value.scope();
        scope.attach(key.to_string(), cx.parent.clone())?;
        let child: Arc<dyn KeyedChild<Arc<C>>> = Arc::new(BundleChild {
            bundle: value.clone(),
        });
        Ok((scope.node().clone(), child))
    }

    fn fingerprint(&self, _cx: &ChildContext, _value: &Arc<C>) -> Option<Fingerprint> {
        None
    }

    fn same_value(&self, a: &Arc<C>, b: &Arc<C>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl<C> KeyedRegistry<Arc<C>>
where
    C: FileBundle + Identifiable,
{
    /// New detached bundle keyed by `id`, ready to be inserted
    pub fn make_bundle(&self, id: &C::Id) -> Result<Arc<C>, SyncError> {
        BundleScope::detached(Some(id.to_key_string()), self.config().clone())
    }
}
