pub mod contract;
pub mod local;

pub use contract::{EntryKind, Storage, StorageEntry};
pub use local::LocalStorage;
