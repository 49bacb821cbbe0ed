//! Reconcile planning
//!
//! Turns an identifier difference into deletions, creations and renames. An
//! id that disappeared and an id that appeared are paired as a rename when
//! their values share a fingerprint that no other removed or inserted value
//! has. Ambiguous fingerprints fall back to delete plus create.

use crate::collection::Difference;
use crate::config::RenameDetection;
use crate::types::Fingerprint;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<Id> {
    /// Removed ids whose children are deleted, in old order
    pub deleted: Vec<Id>,
    /// Inserted ids that get fresh children, in new order
    pub created: Vec<Id>,
    /// `(old, new)` pairs whose child moves to the new key
    pub renamed: Vec<(Id, Id)>,
}

impl<Id> ReconcilePlan<Id> {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty() && self.renamed.is_empty()
    }
}

pub fn plan<Id>(
    difference: &Difference<Id>,
    removed_fingerprint: impl Fn(&Id) -> Option<Fingerprint>,
    inserted_fingerprint: impl Fn(&Id) -> Option<Fingerprint>,
    detection: RenameDetection,
) -> ReconcilePlan<Id>
where
    Id: Clone + Eq + Hash,
{
    if detection == RenameDetection::Disabled
        || difference.removals.is_empty()
        || difference.insertions.is_empty()
    {
        return ReconcilePlan {
            deleted: difference.removals.clone(),
            created: difference.insertions.clone(),
            renamed: Vec::new(),
        };
    }

    let removed_by_value = group_by_fingerprint(&difference.removals, removed_fingerprint);
    let inserted_by_value = group_by_fingerprint(&difference.insertions, inserted_fingerprint);

    let mut renamed_to: HashMap<Id, Id> = HashMap::new();
    let mut renamed_from: HashMap<Id, Id> = HashMap::new();
    for (fingerprint, removed) in &removed_by_value {
        let Some(inserted) = inserted_by_value.get(fingerprint) else {
            continue;
        };
        if let ([old], [new]) = (removed.as_slice(), inserted.as_slice()) {
            renamed_to.insert(old.clone(), new.clone());
            renamed_from.insert(new.clone(), old.clone());
        }
    }

    let renamed = difference
        .removals
        .iter()
        .filter_map(|old| renamed_to.get(old).map(|new| (old.clone(), new.clone())))
        .collect();
    let deleted = difference
        .removals
        .iter()
        .filter(|old| !renamed_to.contains_key(*old))
        .cloned()
        .collect();
    let created = difference
        .insertions
        .iter()
        .filter(|new| !renamed_from.contains_key(*new))
        .cloned()
        .collect();

    ReconcilePlan {
        deleted,
        created,
        renamed,
    }
}

fn group_by_fingerprint<Id: Clone>(
    ids: &[Id],
    fingerprint: impl Fn(&Id) -> Option<Fingerprint>,
) -> HashMap<Fingerprint, Vec<Id>> {
    let mut groups: HashMap<Fingerprint, Vec<Id>> = HashMap::new();
    for id in ids {
        if let Some(fp) = fingerprint(id) {
            groups.entry(fp).or_default().push(id.clone());
        }
    }
    groups
}
