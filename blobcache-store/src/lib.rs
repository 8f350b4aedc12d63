//! Low level storage layer of the blobcache.
//!
//! Three pieces live here, leaves of the whole system:
//!
//! * [ChunkStore] - raw chunk files on disk, one file per chunk at
//!   `<root>/<objectPath>/<offset>`, written atomically.
//! * [MemCache] - the in-memory hot tier in front of the chunk files.
//! * [MetaStore] - the embedded transactional store holding directory and
//!   object metadata, the timestamp-ordered chunk ledger driving eviction,
//!   and the durable pending-upload queue.
//!
//! Everything here is synchronous; the async facade in the root crate calls
//! in for short local operations only. Failure policy is deliberately soft:
//! a broken index entry makes the cache colder, never broken, so individual
//! record corruption is logged and skipped rather than propagated.

pub mod chunk_store;
pub mod mem_cache;
pub mod meta_store;
pub mod types;

pub use chunk_store::ChunkStore;
pub use mem_cache::MemCache;
pub use meta_store::{ListingUpdate, MetaStore, StoreBusy};
pub use types::{
    CacheStats, CachedDirectory, CachedObject, ChunkRef, ObjectInfo, PendingUpload,
};
