//! Gantry cache: key resolution and the cache backend boundary.
//!
//! Failure of the backend degrades a job to a cold run; it never aborts the
//! pipeline.

pub mod keys;
pub mod resolver;
pub mod store;

pub use resolver::{KeyResolver, ResolvedCacheKey, RestoreOutcome};
pub use store::{CacheEntry, CacheStore, FilesystemStore, MemoryStore};
