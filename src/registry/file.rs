//! Registries of single-value files

use super::{ChildContext, ChildFactory, KeyedChild};
use crate::coder::{Coder, CodingContext, JsonCoder, KeyedCoder};
use crate::config::RecoveryPolicy;
use crate::coordinator::{CoordinatorOptions, FileCoordinator};
use crate::error::SyncError;
use crate::node::Node;
use crate::relay::Parent;
use crate::storage::EntryKind;
use crate::types::{Fingerprint, Key, Keyed};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declaration of a keyed folder of files inside a bundle.
///
/// Children have no initial value, so `SyncConfig::recovery` does not apply
/// to them: an entry that fails to decode is logged and skipped when the
/// folder loads, and its file is left as it is.
pub struct ChildrenProperty<T> {
    pub(crate) path: PathBuf,
    pub(crate) coder: Arc<dyn Coder<T>>,
    pub(crate) extension: Option<String>,
}

impl<T> ChildrenProperty<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(path: impl AsRef<Path>, coder: impl Coder<T> + 'static) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            coder: Arc::new(coder),
            extension: None,
        }
    }

    /// Entry names are `<key>.<extension>`
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into().trim_start_matches('.').to_string());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> ChildrenProperty<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// JSON files named `<key>.json`
    pub fn json(path: impl AsRef<Path>) -> Self {
        Self::new(path, JsonCoder).extension("json")
    }
}

impl<K, V> ChildrenProperty<Keyed<K, V>>
where
    K: Key,
    V: Clone + Send + Sync + 'static,
{
    /// Files holding only the value; the key is the entry name
    pub fn keyed(path: impl AsRef<Path>, coder: impl Coder<V> + 'static) -> Self {
        Self::new(path, KeyedCoder::new(coder))
    }
}

/// Creates coordinator children for a [`ChildrenProperty`]
pub struct FileChildFactory<T> {
    coder: Arc<dyn Coder<T>>,
    extension: Option<String>,
}

impl<T> FileChildFactory<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(coder: Arc<dyn Coder<T>>, extension: Option<String>) -> Self {
        Self { coder, extension }
    }

    pub(crate) fn from_property(property: &ChildrenProperty<T>) -> Self {
        Self::new(property.coder.clone(), property.extension.clone())
    }

    fn entry_name(&self, key: &str) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", key, ext),
            None => key.to_string(),
        }
    }

    fn context(cx: &ChildContext, key: &str) -> CodingContext {
        cx.config.coding_context().with_key(key)
    }

    fn options(&self, cx: &ChildContext, key: &str) -> CoordinatorOptions<T> {
        CoordinatorOptions {
            label: format!("{}/{}", cx.label, self.entry_name(key)),
            coder: self.coder.clone(),
            context: Self::context(cx, key),
            initial: None,
            recovery: RecoveryPolicy::Fatal,
            write_delay: cx.config.write_delay(),
            eager_read: false,
            observe: None,
        }
    }
}

impl<T> ChildFactory<T> for FileChildFactory<T>
where
    T: PartialEq + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> EntryKind {
        EntryKind::File
    }

    fn file_name(&self, key: &str) -> String {
        self.entry_name(key)
    }

    fn key_for(&self, file_name: &str) -> Option<String> {
        match &self.extension {
            Some(ext) => file_name
                .strip_suffix(ext.as_str())
                .and_then(|rest| rest.strip_suffix('.'))
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            None => Some(file_name.to_string()),
        }
    }

    fn load(
        &self,
        cx: &ChildContext,
        key: &str,
        node: Node,
    ) -> Result<Arc<dyn KeyedChild<T>>, SyncError> {
        let child: Arc<dyn KeyedChild<T>> =
            FileCoordinator::new(node, cx.parent.clone(), self.options(cx, key));
        Ok(child)
    }

    fn create(
        &self,
        cx: &ChildContext,
        key: &str,
        value: &T,
    ) -> Result<(Node, Arc<dyn KeyedChild<T>>), SyncError> {
        let bytes = self.coder.encode(value, &Self::context(cx, key))?;
        let node = Node::file(bytes);
        let child: Arc<dyn KeyedChild<T>> = FileCoordinator::with_value(
            node.clone(),
            cx.parent.clone(),
            self.options(cx, key),
            value.clone(),
        );
        Ok((node, child))
    }

    fn fingerprint(&self, cx: &ChildContext, value: &T) -> Option<Fingerprint> {
        // Encode without a key so the same value under two keys matches.
        let bytes = self.coder.encode(value, &cx.config.coding_context()).ok()?;
        Some(Fingerprint::of_bytes(&bytes))
    }

    fn same_value(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

impl<T> KeyedChild<T> for FileCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node(&self) -> Node {
        FileCoordinator::node(self).clone()
    }

    fn contents(&self) -> Result<T, SyncError> {
        self.read()
    }

    fn set_contents(&self, value: T) -> Result<(), SyncError> {
        self.write(value);
        Ok(())
    }

    fn adopt(&self, value: T) {
        FileCoordinator::adopt(self, value)
    }

    fn did_rename(&self, key: &str) {
        self.set_key(Some(key.to_string()));
    }

    fn set_parent(&self, parent: Parent) {
        FileCoordinator::set_parent(self, parent)
    }

    fn commit(&self) -> Result<(), SyncError> {
        FileCoordinator::commit(self)
    }

    fn discard(&self) {
        FileCoordinator::discard(self)
    }
}
