use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use filebundle::{
    BundleScope, FileBundle, FileCoordinator, FileProperty, RecoveryPolicy, SyncConfig, SyncError,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::integration::support::{open_counted, settle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Prefs {
    volume: u8,
    theme: String,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            volume: 5,
            theme: "light".to_string(),
        }
    }
}

struct Settings {
    scope: BundleScope,
    prefs: Arc<FileCoordinator<Prefs>>,
    counter: Arc<FileCoordinator<u64>>,
}

impl FileBundle for Settings {
    fn bind(scope: &BundleScope) -> Result<Self, SyncError> {
        Ok(Self {
            scope: scope.clone(),
            prefs: scope.file(
                FileProperty::new("prefs.json")
                    .initial_with(Prefs::default)
                    .recovery(RecoveryPolicy::DiscardAndReset),
            )?,
            counter: scope.file(FileProperty::new("counter.json").initial(0u64))?,
        })
    }

    fn scope(&self) -> &BundleScope {
        &self.scope
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> T {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn rapid_writes_coalesce_into_one_disk_write() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 150;
    let (root, storage) = open_counted::<Settings>(temp.path(), config);
    let settings = root.bundle().clone();
    settle(&root);
    let before = storage.counts();

    for i in 1..=25u64 {
        settings.counter.write(i);
    }
    assert_eq!(settings.counter.read().unwrap(), 25);
    settings.counter.wait_idle();
    root.wait_idle();

    let ops = storage.counts().since(before);
    assert_eq!(ops.writes, 1);
    let on_disk: u64 = read_json(&temp.path().join("counter.json"));
    assert_eq!(on_disk, 25);
}

#[test]
fn commit_persists_the_latest_write_before_the_debounce_elapses() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 60_000;
    config.flush_debounce_ms = 60_000;
    let (root, _storage) = open_counted::<Settings>(temp.path(), config);
    let settings = root.bundle().clone();

    settings.counter.write(1);
    settings.counter.write(2);
    root.commit().unwrap();

    let on_disk: u64 = read_json(&temp.path().join("counter.json"));
    assert_eq!(on_disk, 2);
    assert!(settings.counter.flags().latest_written);
}

#[test]
fn concurrent_writes_and_commits_keep_the_latest_value() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 5;
    config.flush_debounce_ms = 60_000;
    let (root, _storage) = open_counted::<Settings>(temp.path(), config);
    let settings = root.bundle().clone();
    let writers_done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let counter = &settings.counter;
                s.spawn(move || {
                    for i in 0..50u64 {
                        counter.write(t * 1_000 + i);
                        if i % 7 == 0 {
                            counter.commit().unwrap();
                        }
                    }
                    counter.commit().unwrap();
                })
            })
            .collect();
        s.spawn(|| {
            while !writers_done.load(Ordering::SeqCst) {
                settings.counter.commit().unwrap();
            }
        });
        for writer in writers {
            writer.join().unwrap();
        }
        writers_done.store(true, Ordering::SeqCst);
    });

    // Every write was followed by a commit, so the node holds the cached value.
    let cached = settings.counter.read().unwrap();
    let bytes = settings
        .scope()
        .entry("counter.json")
        .unwrap()
        .regular_file_contents()
        .unwrap();
    let in_node: u64 = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(in_node, cached);
    assert!(settings.counter.flags().latest_written);
    assert!(settings.counter.last_error().is_none());

    root.flush().unwrap();
    let on_disk: u64 = read_json(&temp.path().join("counter.json"));
    assert_eq!(on_disk, cached);
}

#[test]
fn missing_files_are_created_from_initial_values() {
    let temp = TempDir::new().unwrap();
    let (root, _storage) = open_counted::<Settings>(temp.path(), SyncConfig::testing());
    settle(&root);

    let prefs: Prefs = read_json(&temp.path().join("prefs.json"));
    assert_eq!(prefs, Prefs::default());
    let text = fs::read_to_string(temp.path().join("prefs.json")).unwrap();
    assert!(text.ends_with('\n'));
}

#[test]
fn unreadable_file_is_reset_to_initial_value() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("prefs.json"), "{ not json").unwrap();
    fs::write(temp.path().join("counter.json"), "3").unwrap();

    let (root, _storage) = open_counted::<Settings>(temp.path(), SyncConfig::testing());
    let settings = root.bundle().clone();
    assert_eq!(settings.prefs.read().unwrap(), Prefs::default());
    assert_eq!(settings.counter.read().unwrap(), 3);

    settings.prefs.wait_idle();
    settle(&root);
    let prefs: Prefs = read_json(&temp.path().join("prefs.json"));
    assert_eq!(prefs, Prefs::default());
}

#[test]
fn unreadable_file_with_fatal_policy_reports_error() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("counter.json"), "three").unwrap();

    let (root, _storage) = open_counted::<Settings>(temp.path(), SyncConfig::testing());
    let settings = root.bundle().clone();
    assert!(matches!(settings.counter.read(), Err(SyncError::Coder(_))));

    // The broken file stays as it was.
    settings.scope().discard();
    drop(settings);
    drop(root);
    assert_eq!(
        fs::read_to_string(temp.path().join("counter.json")).unwrap(),
        "three"
    );
}

#[test]
fn discarded_bundle_never_writes() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 60_000;
    let (root, storage) = open_counted::<Settings>(temp.path(), config);
    let settings = root.bundle().clone();
    settle(&root);
    let before = storage.counts();

    settings.counter.write(99);
    settings.scope().discard();
    settings.counter.write(100);
    drop(settings);
    drop(root);

    assert_eq!(storage.counts().since(before).writes, 0);
    let on_disk: u64 = read_json(&temp.path().join("counter.json"));
    assert_eq!(on_disk, 0);
}

#[test]
fn dropping_the_root_commits_pending_writes() {
    let temp = TempDir::new().unwrap();
    let mut config = SyncConfig::testing();
    config.write_debounce_ms = 60_000;
    config.flush_debounce_ms = 60_000;
    let (root, _storage) = open_counted::<Settings>(temp.path(), config);
    let settings = root.bundle().clone();

    settings
        .prefs
        .update(|prefs| prefs.theme = "dark".to_string())
        .unwrap();
    drop(root);

    let prefs: Prefs = read_json(&temp.path().join("prefs.json"));
    assert_eq!(prefs.theme, "dark");
}
