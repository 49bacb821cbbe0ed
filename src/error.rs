//! Error types
//!
//! One enum per concern, folded into [`SyncError`] at the public API surface.

use std::path::PathBuf;
use thiserror::Error;

/// Filesystem access failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Atomic write to {path} failed: {reason}")]
    AtomicWriteFailed { path: PathBuf, reason: String },

    #[error("Failed to list {path}: {reason}")]
    Walk { path: PathBuf, reason: String },
}

/// Structural errors on the in-memory node tree
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node '{name}' is not a directory")]
    NotADirectory { name: String },

    #[error("Node '{name}' is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Node '{name}' is not attached to a bundle on disk")]
    Detached { name: String },

    #[error("Node '{name}' already belongs to another directory")]
    AlreadyAttached { name: String },

    #[error("Node '{name}' is persisted in another directory and cannot be moved here")]
    CrossDirectoryMove { name: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Encoding and decoding failures raised by coder strategies
#[derive(Debug, Error)]
pub enum CoderError {
    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode value: {0}")]
    Decode(String),

    #[error("Entry key missing or unparsable while decoding")]
    MissingKey,
}

/// Errors raised while binding or mutating a bundle
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Bundle directory does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Bundle entry '{0}' does not exist")]
    MissingEntry(String),

    #[error("No initial value available to create '{0}'")]
    MissingInitialValue(String),

    #[error("Invalid entry key '{0}'")]
    InvalidKey(String),

    #[error("Entry '{key}' holds a value that identifies as '{id}'")]
    IdMismatch { key: String, id: String },

    #[error("Bundle '{0}' is already attached to a parent")]
    AlreadyAttached(String),

    #[error("A bundle cannot be reinitialized in place (key '{0}')")]
    Reinitialize(String),

    #[error("Entry '{path}' is a {actual}, expected a {expected}")]
    KindMismatch {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Coder(#[from] CoderError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(StorageError::IoError(err))
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::ConfigError(err.to_string())
    }
}
