//! Filebundle: typed file bundles on disk
//!
//! Keeps an in-memory graph of typed values in sync with a directory tree.
//! Single values live in files managed by a [`coordinator::FileCoordinator`],
//! keyed collections live in folders managed by a [`registry::KeyedRegistry`],
//! and a [`bundle::BundleRoot`] flushes the whole tree to disk after changes
//! settle.

pub mod bundle;
pub mod coder;
pub mod collection;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod node;
pub mod registry;
pub mod relay;
pub mod schedule;
pub mod storage;
pub mod tooling;
pub mod types;

pub use bundle::{BundleRoot, BundleScope, Committable, DynamicBundle, FileBundle};
pub use coder::{BytesCoder, Coder, CodingContext, JsonCoder, KeyedCoder, TextCoder, TomlCoder};
pub use collection::IdentifierIndexingArray;
pub use config::{AppConfig, RecoveryPolicy, RenameDetection, SyncConfig};
pub use coordinator::{FileCoordinator, FileProperty};
pub use error::SyncError;
pub use registry::{ChildrenProperty, KeyedRegistry, ReconcileReport};
pub use relay::{Observed, Subscription};
pub use types::{Identifiable, Keyed, StringRepresentable};
