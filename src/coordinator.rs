//! Single-value file coordinator
//!
//! A [`FileCoordinator`] owns one typed value backed by one file node. Reads
//! are served from a single-slot cache that is filled lazily by decoding the
//! node. Writes update the cache at once and encode into the node after a
//! debounce window; [`FileCoordinator::commit`] skips the wait.
//!
//! Every cache change bumps a revision. A persist records the revision it
//! encoded, so a write that was overtaken by a newer commit never lands.

use crate::bundle::Committable;
use crate::coder::{coder_for_path, Coder, CodingContext};
use crate::config::RecoveryPolicy;
use crate::error::{BundleError, SyncError};
use crate::node::Node;
use crate::relay::{Callback, ObservableValue, Observers, Parent, Subscription};
use crate::schedule::Debouncer;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) type Initial<T> = Arc<dyn Fn() -> T + Send + Sync>;
pub(crate) type ObserveHook<T> = Arc<dyn Fn(&T, Callback) -> Subscription + Send + Sync>;

/// Lifecycle flags of a coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFlags {
    /// The value was decoded from, or seeded into, the node
    pub initial_read_complete: bool,
    /// The node holds the encoding of the cached value
    pub latest_written: bool,
    /// No further writes will happen
    pub discarded: bool,
}

struct CoordinatorState<T> {
    cache: Option<T>,
    flags: StateFlags,
    revision: u64,
    persisted_revision: u64,
}

pub(crate) struct CoordinatorOptions<T> {
    pub label: String,
    pub coder: Arc<dyn Coder<T>>,
    pub context: CodingContext,
    pub initial: Option<Initial<T>>,
    pub recovery: RecoveryPolicy,
    pub write_delay: Duration,
    pub eager_read: bool,
    pub observe: Option<ObserveHook<T>>,
}

/// Manages one typed value stored in one file
pub struct FileCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    me: Weak<Self>,
    label: String,
    node: Node,
    coder: Arc<dyn Coder<T>>,
    context: RwLock<CodingContext>,
    initial: Option<Initial<T>>,
    recovery: RecoveryPolicy,
    state: Mutex<CoordinatorState<T>>,
    write_lock: Mutex<()>,
    scheduler: Debouncer,
    parent: RwLock<Parent>,
    observers: Observers,
    observe: Option<ObserveHook<T>>,
    value_subscription: Mutex<Option<Subscription>>,
    last_error: Mutex<Option<String>>,
}

impl<T> FileCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Coordinator over an existing file node; the value is decoded on first read
    pub(crate) fn new(node: Node, parent: Parent, options: CoordinatorOptions<T>) -> Arc<Self> {
        let eager = options.eager_read;
        let coordinator = Self::build(node, parent, options, None);
        if eager {
            coordinator.spawn_eager_read();
        }
        coordinator
    }

    /// Coordinator whose node already holds the encoding of `value`
    pub(crate) fn with_value(
        node: Node,
        parent: Parent,
        options: CoordinatorOptions<T>,
        value: T,
    ) -> Arc<Self> {
        let coordinator = Self::build(node, parent, options, Some(value));
        coordinator.observe_cached_value();
        coordinator
    }

    fn build(
        node: Node,
        parent: Parent,
        options: CoordinatorOptions<T>,
        value: Option<T>,
    ) -> Arc<Self> {
        let seeded = value.is_some();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            scheduler: Debouncer::new(format!("write:{}", options.label), options.write_delay),
            label: options.label,
            node,
            coder: options.coder,
            context: RwLock::new(options.context),
            initial: options.initial,
            recovery: options.recovery,
            state: Mutex::new(CoordinatorState {
                cache: value,
                flags: StateFlags {
                    initial_read_complete: seeded,
                    latest_written: seeded,
                    discarded: false,
                },
                revision: 0,
                persisted_revision: 0,
            }),
            write_lock: Mutex::new(()),
            parent: RwLock::new(parent),
            observers: Observers::new(),
            observe: options.observe,
            value_subscription: Mutex::new(None),
            last_error: Mutex::new(None),
        })
    }

    fn spawn_eager_read(&self) {
        let weak = self.me.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("filebundle-read:{}", self.label))
            .spawn(move || {
                if let Some(coordinator) = weak.upgrade() {
                    if let Err(e) = coordinator.read() {
                        tracing::warn!(file = %coordinator.label, "Eager read failed: {}", e);
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::debug!(file = %self.label, "Eager read not started: {}", e);
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flags(&self) -> StateFlags {
        self.state.lock().flags
    }

    pub fn is_discarded(&self) -> bool {
        self.state.lock().flags.discarded
    }

    /// Revision of the cached value; bumps on every change
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Most recent background write failure
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    pub(crate) fn set_parent(&self, parent: Parent) {
        *self.parent.write() = parent;
    }

    pub(crate) fn set_key(&self, key: Option<String>) {
        self.context.write().key = key;
    }

    /// Current value, decoding the file on first access
    pub fn read(&self) -> Result<T, SyncError> {
        if let Some(value) = &self.state.lock().cache {
            return Ok(value.clone());
        }

        let cx = self.context.read().clone();
        let decoded = self
            .node
            .regular_file_contents()
            .map_err(SyncError::from)
            .and_then(|bytes| self.coder.decode(&bytes, &cx).map_err(SyncError::from));

        match decoded {
            Ok(value) => {
                let value = {
                    let mut state = self.state.lock();
                    if state.cache.is_none() {
                        state.cache = Some(value);
                        state.flags.initial_read_complete = true;
                        state.flags.latest_written = state.revision == state.persisted_revision;
                    }
                    state.cache.clone()
                };
                self.observe_cached_value();
                value.ok_or_else(|| BundleError::MissingEntry(self.label.clone()).into())
            }
            Err(e) => self.recover(e),
        }
    }

    fn recover(&self, error: SyncError) -> Result<T, SyncError> {
        match self.recovery {
            RecoveryPolicy::Fatal => {
                tracing::error!(file = %self.label, "Failed to read value: {}", error);
                Err(error)
            }
            RecoveryPolicy::DiscardAndReset => {
                let initial = self
                    .initial
                    .as_ref()
                    .ok_or_else(|| BundleError::MissingInitialValue(self.label.clone()))?;
                tracing::warn!(
                    file = %self.label,
                    "Failed to read value, resetting to initial value: {}",
                    error
                );
                let value = initial();
                {
                    let mut state = self.state.lock();
                    if let Some(existing) = &state.cache {
                        return Ok(existing.clone());
                    }
                    state.cache = Some(value.clone());
                    state.flags.initial_read_complete = true;
                    state.flags.latest_written = false;
                    state.revision += 1;
                }
                self.observe_cached_value();
                self.schedule_persist();
                Ok(value)
            }
        }
    }

    /// Replace the value. Observers and the owning bundle hear about it now;
    /// the file is written after the debounce window.
    pub fn write(&self, value: T) {
        {
            let mut state = self.state.lock();
            if state.flags.discarded {
                tracing::debug!(file = %self.label, "Ignoring write to discarded file");
                return;
            }
            state.cache = Some(value);
            state.revision += 1;
            state.flags.latest_written = false;
        }
        self.observe_cached_value();
        self.did_change();
    }

    /// Read, modify and write back
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, SyncError> {
        let mut value = self.read()?;
        let result = f(&mut value);
        self.write(value);
        Ok(result)
    }

    /// Replace the cached value without writing; the node already matches it.
    pub(crate) fn adopt(&self, value: T) {
        {
            let mut state = self.state.lock();
            if state.flags.discarded {
                return;
            }
            state.cache = Some(value);
            state.flags.initial_read_complete = true;
        }
        self.observe_cached_value();
    }

    /// Persist the cached value immediately, dropping any pending debounced write
    pub fn commit(&self) -> Result<(), SyncError> {
        self.scheduler.cancel();
        self.persist()
    }

    /// Stop writing for good. An in-flight write is allowed to finish first.
    pub fn discard(&self) {
        self.state.lock().flags.discarded = true;
        self.scheduler.cancel();
        let _write = self.write_lock.lock();
        *self.value_subscription.lock() = None;
    }

    /// Block until no debounced write is pending
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    fn schedule_persist(&self) {
        let weak = self.me.clone();
        self.scheduler.schedule(move || {
            if let Some(coordinator) = weak.upgrade() {
                if let Err(e) = coordinator.persist() {
                    tracing::error!(file = %coordinator.label, "Background write failed: {}", e);
                    *coordinator.last_error.lock() = Some(e.to_string());
                }
            }
        });
    }

    fn persist(&self) -> Result<(), SyncError> {
        if !self.encode_into_node()? {
            return Ok(());
        }
        let parent = self.parent.read().clone();
        parent.notify_write();
        Ok(())
    }

    /// Encode the cached value into the node unless it is already there.
    /// Returns whether the node changed.
    fn encode_into_node(&self) -> Result<bool, SyncError> {
        let _write = self.write_lock.lock();
        let (value, revision) = {
            let state = self.state.lock();
            if state.flags.discarded || state.persisted_revision >= state.revision {
                return Ok(false);
            }
            match &state.cache {
                Some(value) => (value.clone(), state.revision),
                None => return Ok(false),
            }
        };

        let cx = self.context.read().clone();
        let bytes = self.coder.encode(&value, &cx)?;
        self.node.set_regular_file_contents(bytes)?;
        {
            let mut state = self.state.lock();
            state.persisted_revision = revision;
            state.flags.latest_written = state.revision == revision;
        }
        tracing::debug!(file = %self.label, revision, "Wrote value into node");
        Ok(true)
    }

    fn did_change(&self) {
        self.observers.notify();
        let parent = self.parent.read().clone();
        parent.notify();
        self.schedule_persist();
    }

    /// The cached value changed in place through its own notifications
    fn value_did_change(&self) {
        {
            let mut state = self.state.lock();
            if state.flags.discarded || state.cache.is_none() {
                return;
            }
            state.revision += 1;
            state.flags.latest_written = false;
        }
        self.did_change();
    }

    fn observe_cached_value(&self) {
        let Some(hook) = &self.observe else {
            return;
        };
        let Some(value) = self.state.lock().cache.clone() else {
            return;
        };
        let weak = self.me.clone();
        let callback: Callback = Arc::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.value_did_change();
            }
        });
        *self.value_subscription.lock() = Some(hook(&value, callback));
    }
}

impl<T> Committable for FileCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn commit(&self) -> Result<(), SyncError> {
        FileCoordinator::commit(self)
    }

    fn discard(&self) {
        FileCoordinator::discard(self)
    }
}

impl<T> Drop for FileCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.state.get_mut().flags.discarded {
            return;
        }
        if let Err(e) = self.commit() {
            tracing::error!(file = %self.label, "Final write failed: {}", e);
        }
    }
}

/// Declaration of a single-value file inside a bundle
pub struct FileProperty<T> {
    pub(crate) path: PathBuf,
    pub(crate) coder: Arc<dyn Coder<T>>,
    pub(crate) initial: Option<Initial<T>>,
    pub(crate) recovery: Option<RecoveryPolicy>,
    pub(crate) observe: Option<ObserveHook<T>>,
}

impl<T> FileProperty<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// File coded as TOML for `.toml` paths and JSON otherwise
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let coder: Arc<dyn Coder<T>> = Arc::from(coder_for_path::<T>(&path));
        Self::from_parts(path, coder)
    }
}

impl<T> FileProperty<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_coder(path: impl AsRef<Path>, coder: impl Coder<T> + 'static) -> Self {
        Self::from_parts(path.as_ref().to_path_buf(), Arc::new(coder))
    }

    fn from_parts(path: PathBuf, coder: Arc<dyn Coder<T>>) -> Self {
        Self {
            path,
            coder,
            initial: None,
            recovery: None,
            observe: None,
        }
    }

    /// Value used to create a missing file and to reset an unreadable one
    pub fn initial(self, value: T) -> Self {
        self.initial_with(move || value.clone())
    }

    pub fn initial_with(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.initial = Some(Arc::new(f));
        self
    }

    /// Override the bundle's default recovery policy
    pub fn recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = Some(policy);
        self
    }

    /// Treat changes announced by the value itself as writes
    pub fn observed(mut self) -> Self
    where
        T: ObservableValue,
    {
        self.observe = Some(Arc::new(|value: &T, callback: Callback| {
            value.subscribe(callback)
        }));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
