//! Configuration
//!
//! [`SyncConfig`] drives the synchronization engine and is passed explicitly to
//! every bundle root. [`AppConfig`] wraps it together with logging settings for
//! the command-line front end.

mod loader;

pub use loader::ConfigLoader;

use crate::coder::{CodingContext, CodingOptions};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a coordinator does when its file cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Surface the decode error to the reader
    #[default]
    Fatal,
    /// Log, substitute the initial value and rewrite the file
    DiscardAndReset,
}

/// How keyed registries recognise renamed children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameDetection {
    /// Match removed and inserted entries by value fingerprint
    #[default]
    Content,
    /// Every key change is a delete plus a create
    Disabled,
}

/// Synchronization engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a coordinator writes its value into the tree
    pub write_debounce_ms: u64,
    /// Quiet period before the root flushes the tree to disk
    pub flush_debounce_ms: u64,
    /// Create the bundle directory when it does not exist
    pub create_if_needed: bool,
    /// Housekeeping entries never loaded or written
    pub ignored_names: Vec<String>,
    /// Default recovery for single-value files. Registry children have no
    /// initial value and skip unreadable entries instead.
    pub recovery: RecoveryPolicy,
    pub rename_detection: RenameDetection,
    /// Decode file values on a background thread as soon as they are bound
    pub eager_read: bool,
    pub coding: CodingOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_debounce_ms: 200,
            flush_debounce_ms: 50,
            create_if_needed: true,
            ignored_names: vec![".DS_Store".to_string()],
            recovery: RecoveryPolicy::default(),
            rename_detection: RenameDetection::default(),
            eager_read: false,
            coding: CodingOptions::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short debounce windows for tests
    pub fn testing() -> Self {
        Self {
            write_debounce_ms: 10,
            flush_debounce_ms: 10,
            ..Self::default()
        }
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_names.iter().any(|ignored| ignored == name)
    }

    pub fn coding_context(&self) -> CodingContext {
        CodingContext::new(self.coding.clone())
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}
