use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use filebundle::error::BundleError;
use filebundle::{
    BundleRoot, BundleScope, FileBundle, FileCoordinator, FileProperty, Identifiable,
    KeyedRegistry, SyncConfig, SyncError, TextCoder,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::integration::support::{open_counted, settle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct LibraryInfo {
    name: String,
    version: u32,
}

struct Shelf {
    scope: BundleScope,
    label: Arc<FileCoordinator<String>>,
}

impl FileBundle for Shelf {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
            label: scope.file(
                FileProperty::with_coder("label.txt", TextCoder).initial(String::new()),
            )?,
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

impl Identifiable for Shelf {
    type Id = String;

    fn id(&self) -> String {
        self.scope.key().unwrap_or_default()
    }
}

struct Archive {
    scope: BundleScope,
    notes: Arc<FileCoordinator<String>>,
}

impl FileBundle for Archive {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
            notes: scope.file(
                FileProperty::with_coder("notes.txt", TextCoder).initial(String::new()),
            )?,
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

struct Library {
    scope: BundleScope,
    info: Arc<FileCoordinator<LibraryInfo>>,
    settings: Arc<FileCoordinator<toml::Table>>,
    archive: Arc<Archive>,
    shelves: Arc<KeyedRegistry<Arc<Shelf>>>,
}

impl FileBundle for Library {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
            info: scope.file(FileProperty::new("library.json").initial_with(LibraryInfo::default))?,
            settings: scope
                .file(FileProperty::new("meta/settings.toml").initial(toml::Table::new()))?,
            archive: scope.bundle("archive")?,
            shelves: scope.bundles("shelves")?,
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

#[test]
fn opening_a_regular_file_fails() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("library");
    fs::write(&file, "not a directory").unwrap();

    let result = BundleRoot::<Library>::open(&file, SyncConfig::testing());
    assert!(matches!(
        result,
        Err(SyncError::Bundle(BundleError::NotADirectory(_)))
    ));
}

#[test]
fn binding_lays_out_the_declared_structure() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Library>(temp.path(), SyncConfig::testing());
    settle(&root);

    assert!(temp.path().join("library.json").is_file());
    assert!(temp.path().join("meta/settings.toml").is_file());
    assert!(temp.path().join("archive/notes.txt").is_file());
    assert!(temp.path().join("shelves").is_dir());
}

#[test]
fn nested_bundles_round_trip_through_disk() {
    let temp = TempDir::new().unwrap();
    {
        let root = BundleRoot::<Library>::open(temp.path(), SyncConfig::testing()).unwrap();
        let library = root.bundle().clone();
        library
            .info
            .write(LibraryInfo {
                name: "home".to_string(),
                version: 2,
            });
        library.archive.notes.write("old stuff".to_string());
        let mut settings = toml::Table::new();
        settings.insert("sort".to_string(), toml::Value::String("title".to_string()));
        library.settings.write(settings);

        let fiction = library.shelves.make_bundle(&"fiction".to_string()).unwrap();
        fiction.label.write("Fiction".to_string());
        library.shelves.insert(fiction.clone()).unwrap();
        assert!(fiction.scope().is_attached());
        root.commit().unwrap();
    }

    assert_eq!(
        fs::read_to_string(temp.path().join("shelves/fiction/label.txt")).unwrap(),
        "Fiction"
    );
    let settings = fs::read_to_string(temp.path().join("meta/settings.toml")).unwrap();
    assert!(settings.contains("sort = \"title\""));

    let root = BundleRoot::<Library>::open(temp.path(), SyncConfig::testing()).unwrap();
    let library = root.bundle();
    assert_eq!(library.info.read().unwrap().name, "home");
    assert_eq!(library.archive.notes.read().unwrap(), "old stuff");
    assert_eq!(library.shelves.ids(), vec!["fiction".to_string()]);
    let fiction = library.shelves.get(&"fiction".to_string()).unwrap().unwrap();
    assert_eq!(fiction.label.read().unwrap(), "Fiction");
}

#[test]
fn removing_a_nested_bundle_deletes_its_directory() {
    let temp = TempDir::new().unwrap();
    let (root, storage) = open_counted::<Library>(temp.path(), SyncConfig::testing());
    let library = root.bundle().clone();

    for key in ["a", "b"] {
        let shelf = library.shelves.make_bundle(&key.to_string()).unwrap();
        library.shelves.insert(shelf).unwrap();
    }
    settle(&root);
    assert!(temp.path().join("shelves/a/label.txt").is_file());
    let before = storage.counts();

    let removed = library.shelves.remove(&"a".to_string()).unwrap().unwrap();
    assert_eq!(removed.scope().key().as_deref(), Some("a"));
    removed.label.write("never written".to_string());
    settle(&root);

    assert!(!temp.path().join("shelves/a").exists());
    assert!(temp.path().join("shelves/b").is_dir());
    assert_eq!(storage.counts().since(before).removes, 1);
}

#[test]
fn root_observers_hear_about_writes_before_they_persist() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 60_000;
    let (root, _storage) = open_counted::<Library>(temp.path(), config);
    let library = root.bundle().clone();
    settle(&root);

    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let subscription = root.subscribe(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    library.archive.notes.write("changed".to_string());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Writing the value out and flushing it are not new changes.
    settle(&root);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(temp.path().join("archive/notes.txt")).unwrap(),
        "changed"
    );

    drop(subscription);
    library.archive.notes.write("again".to_string());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn observer_can_commit_the_root_when_notified() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 60_000;
    config.flush_debounce_ms = 60_000;
    let root = Arc::new(BundleRoot::<Library>::open(temp.path(), config).unwrap());
    let library = root.bundle().clone();

    let saves = Arc::new(AtomicUsize::new(0));
    let counted = saves.clone();
    let weak = Arc::downgrade(&root);
    let _subscription = root.subscribe(move || {
        if let Some(root) = weak.upgrade() {
            root.commit().unwrap();
            counted.fetch_add(1, Ordering::SeqCst);
        }
    });

    library.archive.notes.write("saved on change".to_string());
    assert_eq!(saves.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(temp.path().join("archive/notes.txt")).unwrap(),
        "saved on change"
    );
}

#[test]
fn lazily_bound_bundles_can_be_listed_from_an_observer() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("shelves/poetry")).unwrap();

    let root = BundleRoot::<Library>::open(temp.path(), SyncConfig::testing()).unwrap();
    let library = root.bundle().clone();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let shelves = Arc::downgrade(&library.shelves);
    let _subscription = library.shelves.subscribe(move || {
        if let Some(shelves) = shelves.upgrade() {
            recorded.lock().push(shelves.ids());
        }
    });

    // Binding "poetry" creates its missing label file.
    assert_eq!(library.shelves.ids(), vec!["poetry".to_string()]);
    settle(&root);
    assert!(temp.path().join("shelves/poetry/label.txt").is_file());

    let fiction = library.shelves.make_bundle(&"fiction".to_string()).unwrap();
    library.shelves.insert(fiction).unwrap();
    assert_eq!(
        seen.lock().last().cloned(),
        Some(vec!["poetry".to_string(), "fiction".to_string()])
    );
}

#[test]
fn ignored_entries_are_left_alone() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join(".DS_Store"), "finder").unwrap();

    let root = BundleRoot::<Library>::open(temp.path(), SyncConfig::testing()).unwrap();
    assert!(root.node().child(".DS_Store").is_none());
    settle(&root);
    assert_eq!(
        fs::read_to_string(temp.path().join(".DS_Store")).unwrap(),
        "finder"
    );
}

#[test]
fn declared_file_where_a_directory_exists_is_rejected() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("library.json")).unwrap();

    let result = BundleRoot::<Library>::open(temp.path(), SyncConfig::testing());
    assert!(matches!(
        result,
        Err(SyncError::Bundle(BundleError::KindMismatch { .. }))
    ));
}
