//! Identifier-indexed ordered collection
//!
//! [`IdentifierIndexingArray`] keeps items in insertion order while indexing
//! them by identifier. It is the observable contents of a keyed folder and the
//! input to the reconcile diff.

use crate::types::Identifiable;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

type IdFn<Item, Id> = Arc<dyn Fn(&Item) -> Id + Send + Sync>;

/// Ordered items addressable by identifier
pub struct IdentifierIndexingArray<Item, Id> {
    items: Vec<Item>,
    index: HashMap<Id, usize>,
    id_of: IdFn<Item, Id>,
}

/// Identifiers only present on one side of a comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference<Id> {
    /// In the old collection only, in old order
    pub removals: Vec<Id>,
    /// In the new collection only, in new order
    pub insertions: Vec<Id>,
}

impl<Id> Difference<Id> {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.insertions.is_empty()
    }
}

impl<Item> IdentifierIndexingArray<Item, Item::Id>
where
    Item: Identifiable,
{
    pub fn new() -> Self {
        Self::with_id_fn(|item: &Item| item.id())
    }
}

impl<Item> Default for IdentifierIndexingArray<Item, Item::Id>
where
    Item: Identifiable,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Item, Id> IdentifierIndexingArray<Item, Id>
where
    Id: Clone + Eq + Hash,
{
    /// Collection whose identifiers come from `id_of`
    pub fn with_id_fn(id_of: impl Fn(&Item) -> Id + Send + Sync + 'static) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            id_of: Arc::new(id_of),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn id_of(&self, item: &Item) -> Id {
        (self.id_of)(item)
    }

    /// Insert at the end, or replace in place when the id is already present.
    /// Returns the replaced item.
    pub fn upsert(&mut self, item: Item) -> Option<Item> {
        let id = self.id_of(&item);
        match self.index.get(&id) {
            Some(&pos) => Some(std::mem::replace(&mut self.items[pos], item)),
            None => {
                self.index.insert(id, self.items.len());
                self.items.push(item);
                None
            }
        }
    }

    pub fn get(&self, id: &Id) -> Option<&Item> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    /// Mutable access. Changing the item's identity through this reference
    /// leaves the index stale.
    pub fn get_mut(&mut self, id: &Id) -> Option<&mut Item> {
        match self.index.get(id) {
            Some(&pos) => self.items.get_mut(pos),
            None => None,
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.index.contains_key(id)
    }

    pub fn position(&self, id: &Id) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Remove by id, preserving the order of the remaining items
    pub fn remove(&mut self, id: &Id) -> Option<Item> {
        let pos = self.index.remove(id)?;
        let item = self.items.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(item)
    }

    pub fn ids(&self) -> Vec<Id> {
        self.items.iter().map(|item| self.id_of(item)).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Item] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Item> {
        self.items
    }

    /// Identifier changes needed to turn `old` into `self`
    pub fn difference(&self, old: &Self) -> Difference<Id> {
        let removals = old
            .items
            .iter()
            .map(|item| old.id_of(item))
            .filter(|id| !self.index.contains_key(id))
            .collect();
        let insertions = self
            .items
            .iter()
            .map(|item| self.id_of(item))
            .filter(|id| !old.index.contains_key(id))
            .collect();
        Difference {
            removals,
            insertions,
        }
    }

    /// Ids present in both collections, in the order of `self`
    pub fn retained(&self, old: &Self) -> Vec<Id> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .map(|item| self.id_of(item))
            .filter(|id| old.index.contains_key(id) && seen.insert(id.clone()))
            .collect()
    }
}

impl<Item, Id> Clone for IdentifierIndexingArray<Item, Id>
where
    Item: Clone,
    Id: Clone,
{
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            index: self.index.clone(),
            id_of: self.id_of.clone(),
        }
    }
}

impl<Item, Id> PartialEq for IdentifierIndexingArray<Item, Id>
where
    Item: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<Item: fmt::Debug, Id> fmt::Debug for IdentifierIndexingArray<Item, Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<Item> FromIterator<Item> for IdentifierIndexingArray<Item, Item::Id>
where
    Item: Identifiable,
{
    /// Later items replace earlier ones with the same id
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        let mut collection = Self::new();
        for item in iter {
            collection.upsert(item);
        }
        collection
    }
}

impl<'a, Item, Id> IntoIterator for &'a IdentifierIndexingArray<Item, Id> {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
