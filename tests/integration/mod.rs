//! Integration tests for file bundle synchronization

mod bundle_root;
mod coordinator_debounce;
mod registry_reconcile;
mod support;
