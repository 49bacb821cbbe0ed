//! Change notification
//!
//! Children hold a non-owning [`Parent`] handle and call
//! [`ChangeListener::child_did_update`] synchronously when they change. That
//! signal reaches external observers, which register callbacks on
//! [`Observers`] and stay registered for as long as they hold the returned
//! [`Subscription`].
//!
//! [`ChangeListener::child_did_write`] is the internal signal that a node
//! below was rewritten and the tree needs flushing. It never runs observer
//! callbacks.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Weak};

/// Receives "something below me changed" signals
pub trait ChangeListener: Send + Sync {
    fn child_did_update(&self);
    /// A node below now holds new bytes
    fn child_did_write(&self);
}

/// Non-owning handle from a child to whatever owns it
#[derive(Clone, Default)]
pub struct Parent(Option<Weak<dyn ChangeListener>>);

impl Parent {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(listener: Weak<dyn ChangeListener>) -> Self {
        Self(Some(listener))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Signal the parent if it is still alive
    pub fn notify(&self) {
        if let Some(parent) = self.0.as_ref().and_then(Weak::upgrade) {
            parent.child_did_update();
        }
    }

    pub fn notify_write(&self) {
        if let Some(parent) = self.0.as_ref().and_then(Weak::upgrade) {
            parent.child_did_write();
        }
    }
}

impl fmt::Debug for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Parent").field(&self.is_set()).finish()
    }
}

pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct ObserverList {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// Zero-payload change callbacks
#[derive(Clone)]
pub struct Observers {
    list: Arc<Mutex<ObserverList>>,
}

impl Observers {
    pub fn new() -> Self {
        Self {
            list: Arc::new(Mutex::new(ObserverList {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let mut list = self.list.lock();
        let id = list.next_id;
        list.next_id += 1;
        list.callbacks.push((id, Arc::new(callback)));
        Subscription {
            list: Arc::downgrade(&self.list),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback. Callbacks run without the list locked, so they
    /// may subscribe or unsubscribe.
    pub fn notify(&self) {
        let callbacks: Vec<Callback> = self
            .list
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle; dropping it unsubscribes
pub struct Subscription {
    list: Weak<Mutex<ObserverList>>,
    id: u64,
}

impl Subscription {
    /// Keep the callback registered for the lifetime of the observed object
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.lock().callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// A value that announces its own changes
pub trait ObservableValue {
    fn subscribe(&self, callback: Callback) -> Subscription;
}

/// Shared, observable cell.
///
/// Clones share the same value. Serializes as the inner value.
pub struct Observed<T> {
    value: Arc<RwLock<T>>,
    observers: Observers,
}

impl<T> Observed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            observers: Observers::new(),
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.write() = value;
        self.observers.notify();
    }

    /// Mutate in place, then notify
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.value.write());
        self.observers.notify();
        result
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl<T> ObservableValue for Observed<T> {
    fn subscribe(&self, callback: Callback) -> Subscription {
        self.observers.subscribe(move || callback())
    }
}

impl<T> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            observers: self.observers.clone(),
        }
    }
}

impl<T: Default> Default for Observed<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: PartialEq> PartialEq for Observed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.value.read() == *other.value.read()
    }
}

impl<T: fmt::Debug> fmt::Debug for Observed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observed").field(&*self.value.read()).finish()
    }
}

impl<T: Serialize> Serialize for Observed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Observed<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Observed::new)
    }
}
