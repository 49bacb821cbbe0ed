use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use filebundle::error::BundleError;
use filebundle::registry::{Contents, ReconcileReport};
use filebundle::{
    BundleScope, ChildrenProperty, FileBundle, KeyedRegistry, Keyed, SyncConfig, SyncError,
    TextCoder,
};
use tempfile::TempDir;

use crate::integration::support::{open_counted, settle};

type Item = Keyed<u64, String>;

struct Notes {
    scope: BundleScope,
    items: Arc<KeyedRegistry<Item>>,
}

impl FileBundle for Notes {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
            items: scope.children(ChildrenProperty::keyed("items", TextCoder).extension("txt"))?,
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

fn items(pairs: &[(u64, &str)]) -> Contents<Item> {
    pairs
        .iter()
        .map(|(key, value)| Keyed::new(*key, value.to_string()))
        .collect()
}

fn counter(registry: &KeyedRegistry<Item>) -> (Arc<AtomicUsize>, filebundle::Subscription) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let subscription = registry.subscribe(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    (hits, subscription)
}

#[test]
fn set_contents_deletes_creates_and_leaves_unchanged_files_alone() {
    let temp = TempDir::new().unwrap();
    let (root, storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes
        .items
        .set_contents(items(&[(1, "a"), (2, "b"), (3, "c")]))
        .unwrap();
    settle(&root);
    let before = storage.counts();

    let (hits, _subscription) = counter(&notes.items);
    let report = notes
        .items
        .set_contents(items(&[(1, "a"), (3, "c"), (4, "d")]))
        .unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            removed: 1,
            inserted: 1,
            renamed: 0,
            updated: 0,
        }
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    settle(&root);
    let ops = storage.counts().since(before);
    assert_eq!(ops.writes, 1);
    assert_eq!(ops.removes, 1);
    assert_eq!(ops.renames, 0);

    let dir = temp.path().join("items");
    assert!(!dir.join("2.txt").exists());
    assert_eq!(fs::read_to_string(dir.join("4.txt")).unwrap(), "d");
    assert_eq!(fs::read_to_string(dir.join("1.txt")).unwrap(), "a");
    assert_eq!(fs::read_to_string(dir.join("3.txt")).unwrap(), "c");
    assert_eq!(notes.items.ids(), vec![1, 3, 4]);
}

#[test]
fn rekeyed_value_is_moved_not_recreated() {
    let temp = TempDir::new().unwrap();
    let (root, storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes
        .items
        .set_contents(items(&[(1, "v1"), (2, "v2")]))
        .unwrap();
    settle(&root);
    let moved = notes.items.child(&2).unwrap();
    let node = moved.node();
    let before = storage.counts();

    let report = notes
        .items
        .set_contents(items(&[(1, "v1"), (3, "v2")]))
        .unwrap();
    assert_eq!(report.renamed, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(report.inserted, 0);

    let after = notes.items.child(&3).unwrap();
    assert!(std::ptr::eq(
        Arc::as_ptr(&moved) as *const (),
        Arc::as_ptr(&after) as *const ()
    ));
    assert!(after.node().ptr_eq(&node));
    assert_eq!(after.contents().unwrap(), Keyed::new(3, "v2".to_string()));

    settle(&root);
    let ops = storage.counts().since(before);
    assert_eq!(ops.writes, 0);
    assert_eq!(ops.removes, 0);
    assert!(ops.renames > 0);

    let dir = temp.path().join("items");
    assert!(!dir.join("2.txt").exists());
    assert_eq!(fs::read_to_string(dir.join("3.txt")).unwrap(), "v2");
}

#[test]
fn keys_can_be_swapped_in_one_reconcile() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes
        .items
        .set_contents(items(&[(1, "one"), (2, "two")]))
        .unwrap();
    settle(&root);

    let report = notes
        .items
        .set_contents(items(&[(2, "one"), (1, "two")]))
        .unwrap();
    assert_eq!(report.updated, 2);

    settle(&root);
    let dir = temp.path().join("items");
    assert_eq!(fs::read_to_string(dir.join("1.txt")).unwrap(), "two");
    assert_eq!(fs::read_to_string(dir.join("2.txt")).unwrap(), "one");
}

#[test]
fn ambiguous_values_fall_back_to_delete_and_create() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes
        .items
        .set_contents(items(&[(1, "same"), (2, "same")]))
        .unwrap();
    let report = notes.items.set_contents(items(&[(3, "same")])).unwrap();
    assert_eq!(report.renamed, 0);
    assert_eq!(report.removed, 2);
    assert_eq!(report.inserted, 1);

    settle(&root);
    let dir = temp.path().join("items");
    assert!(!dir.join("1.txt").exists());
    assert!(!dir.join("2.txt").exists());
    assert_eq!(fs::read_to_string(dir.join("3.txt")).unwrap(), "same");
}

#[test]
fn repeated_set_contents_touches_nothing() {
    let temp = TempDir::new().unwrap();
    let (root, storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();
    let contents = items(&[(1, "a"), (2, "b")]);

    notes.items.set_contents(contents.clone()).unwrap();
    settle(&root);
    let before = storage.counts();

    let (hits, _subscription) = counter(&notes.items);
    let report = notes.items.set_contents(contents).unwrap();
    assert_eq!(report, ReconcileReport::default());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    settle(&root);
    assert_eq!(storage.counts().since(before).mutations(), 0);
}

#[test]
fn updating_a_retained_value_notifies_once() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes
        .items
        .set_contents(items(&[(1, "a"), (2, "b")]))
        .unwrap();
    settle(&root);

    let (registry_hits, _registry_subscription) = counter(&notes.items);
    let root_hits = Arc::new(AtomicUsize::new(0));
    let counted = root_hits.clone();
    let _root_subscription = root.subscribe(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    let report = notes
        .items
        .set_contents(items(&[(1, "A"), (2, "b")]))
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(registry_hits.load(Ordering::SeqCst), 1);
    assert_eq!(root_hits.load(Ordering::SeqCst), 1);

    // The debounced write of item 1 lands without a second notification.
    std::thread::sleep(std::time::Duration::from_millis(100));
    root.wait_idle();
    settle(&root);
    assert_eq!(registry_hits.load(Ordering::SeqCst), 1);
    assert_eq!(root_hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(temp.path().join("items/1.txt")).unwrap(),
        "A"
    );
}

#[test]
fn changed_value_under_same_key_is_rewritten() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();

    notes.items.insert(Keyed::new(7, "draft".to_string())).unwrap();
    let report = notes.items.insert(Keyed::new(7, "final".to_string())).unwrap();
    assert_eq!(report.updated, 1);

    settle(&root);
    assert_eq!(
        fs::read_to_string(temp.path().join("items/7.txt")).unwrap(),
        "final"
    );
    assert_eq!(
        notes.items.get(&7).unwrap(),
        Some(Keyed::new(7, "final".to_string()))
    );
}

#[test]
fn loading_skips_unrelated_and_unparsable_entries() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("items");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("5.txt"), "five").unwrap();
    fs::write(dir.join("9.txt"), "nine").unwrap();
    fs::write(dir.join("notanumber.txt"), "x").unwrap();
    fs::write(dir.join("6.md"), "wrong extension").unwrap();
    fs::write(dir.join(".DS_Store"), "finder").unwrap();
    fs::create_dir_all(dir.join("10.txt")).unwrap();

    let (root, storage) = open_counted::<Notes>(temp.path(), SyncConfig::testing());
    let notes = root.bundle().clone();
    assert_eq!(storage.counts().reads, 0);

    let contents = notes.items.contents().unwrap();
    assert_eq!(contents.ids(), vec![5, 9]);
    assert_eq!(contents.get(&5).unwrap().value, "five");

    notes.items.remove(&9).unwrap();
    settle(&root);
    assert!(!dir.join("9.txt").exists());
    assert!(dir.join("notanumber.txt").exists());
    assert_eq!(fs::read_to_string(dir.join(".DS_Store")).unwrap(), "finder");
}

#[test]
fn invalid_keys_are_rejected_before_any_change() {
    struct Named {
        scope: BundleScope,
        entries: Arc<KeyedRegistry<Keyed<String, String>>>,
    }

    impl FileBundle for Named {
        fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
            Ok(Self {
                scope: scope.clone(),
                entries: scope.children(ChildrenProperty::keyed("named", TextCoder))?,
            })
        }

        fn scope(&self) -> &BundleScope {
            &self.scope
        }
    }

    let named: Arc<Named> =
        BundleScope::detached(None, Arc::new(SyncConfig::testing())).unwrap();
    named
        .entries
        .insert(Keyed::new("kept".to_string(), "x".to_string()))
        .unwrap();

    for key in ["../escape", "a/b", "", ".DS_Store"] {
        let result = named
            .entries
            .insert(Keyed::new(key.to_string(), "y".to_string()));
        assert!(matches!(
            result,
            Err(SyncError::Bundle(BundleError::InvalidKey(_)))
        ));
    }
    assert_eq!(named.entries.ids(), vec!["kept".to_string()]);
}
