//! Partitioned response cache for offline support.
//!
//! This module provides the storage side of the engine:
//! - Named caches holding immutable response blobs (`store`)
//! - Count/age limits applied after every write (`eviction`)
//! - Deployment-version tagging and activation cleanup (`generation`)

pub mod eviction;
pub mod generation;
pub mod store;

pub use eviction::EvictionPolicy;
pub use store::{CacheStore, NoopStore, SqliteStore, StoredResponse};
