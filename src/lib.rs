//! A chunked read-through / write-through cache for remote object stores.
//!
//! The cache wraps an arbitrary remote ("the source FS") behind the same
//! object-store shaped interface and accelerates streamed reads of large,
//! mostly-immutable blobs. Objects are split into fixed-size byte ranges
//! ("chunks") which a pool of download workers fetches ahead of the
//! reader. Chunks live in two tiers: a RAM hot map and a bounded on-disk
//! store, with an embedded transactional metadata store tracking directory
//! listings, object records, the timestamp-ordered chunk ledger and the
//! durable queue of staged writes.
//!
//! # Reading
//!
//! [CacheFs::open] hands out an [ObjectHandle]. Every time the read
//! position enters a new chunk the handle re-seeds its prefetch window:
//! the next `workers` chunk-start offsets are pushed onto a buffered
//! queue, each worker owns one reusable range reader into the source, and
//! finished chunks land in memory and on disk. `read` only blocks while
//! the chunk under the cursor is still in flight. Lookup order is always
//! memory, then disk, then waiting on the workers.
//!
//! # Writing
//!
//! Without staging, writes pass through to the source (optionally teeing
//! the stream into the chunk store). With a staging path configured,
//! writes land in a local staging tree, a durable pending record is
//! queued, and the background uploader moves the file to the source later;
//! rename and delete of a staged file are queue operations until the
//! upload has begun.
//!
//! # Coherence
//!
//! Directory listings and object records carry a TTL and are reconciled
//! against the source when they expire. When the source delivers change
//! notifications the cache subscribes and translates each one into record
//! expiry plus chunk eviction; when it cannot, the cache synthesizes
//! notifications from its own mutating operations, so upstream consumers
//! can subscribe either way. A janitor task periodically walks the chunk
//! ledger from the oldest entry forward to keep the disk tier inside its
//! configured bound.

pub mod commands;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
mod janitor;
pub mod limiter;
pub mod notify;
pub mod remote;
pub mod uploader;

pub use blobcache_store::types::{CacheStats, CachedDirectory, CachedObject, ObjectInfo};

pub use config::CacheConfig;
pub use error::FsError;
pub use fs::CacheFs;
pub use handle::{ObjectHandle, ReaderHint, SeekableObjectReader};
pub use notify::ChangeCallback;
pub use remote::{
    AboutInfo, ChangeEvent, DataStream, DirInfo, Entry, EntryKind, Features, LocalFs, RangeReader,
    RemoteFs,
};
pub use uploader::{UploadEvent, UploadStatus, UploaderControl};
