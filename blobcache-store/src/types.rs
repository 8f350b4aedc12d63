//! Record types persisted in the metadata store, plus path and time helpers.
//!
//! All cache paths are kept in a normalized form: no leading or trailing
//! slashes, `""` denoting the cache root. The metadata store and the chunk
//! store both key their contents by these normalized paths, so the helpers
//! here are the single source of truth for path arithmetic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Nanoseconds since the unix epoch.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

static LAST_TS: AtomicI64 = AtomicI64::new(0);

/// A strictly increasing nanosecond timestamp, used as chunk ledger key.
///
/// Wall-clock time can repeat at nanosecond resolution under load, but the
/// ledger needs one live key per entry, so ties advance by one.
pub fn next_chunk_ts() -> i64 {
    let now = unix_nanos();
    let mut prev = LAST_TS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_TS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(p) => prev = p,
        }
    }
}

/// Normalize a remote path: strip surrounding slashes, collapse empty
/// segments. The cache root is `""`.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent directory of a normalized path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    })
}

/// Leaf name of a normalized path.
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a normalized directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether `path` is an immediate child of `dir`.
pub fn is_direct_child(dir: &str, path: &str) -> bool {
    match parent(path) {
        Some(p) => p == dir,
        None => false,
    }
}

/// Whether `path` equals `dir` or lies anywhere below it.
pub fn is_within(dir: &str, path: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    path == dir || path.starts_with(&format!("{}/", dir))
}

/// Source-side object metadata as mirrored into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    /// Modification time, unix seconds.
    pub mod_time: i64,
    #[serde(default)]
    pub storable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn new(path: &str, size: u64, mod_time: i64) -> Self {
        Self {
            path: normalize(path),
            size,
            mod_time,
            storable: true,
            hashes: BTreeMap::new(),
        }
    }
}

/// An object record as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedObject {
    #[serde(flatten)]
    pub info: ObjectInfo,
    /// Insertion/refresh time, unix nanoseconds. `0` marks the record
    /// expired regardless of the configured info age.
    pub cache_ts: i64,
}

impl CachedObject {
    pub fn new(info: ObjectInfo) -> Self {
        Self {
            info,
            cache_ts: unix_nanos(),
        }
    }

    pub fn is_fresh(&self, info_age: Duration) -> bool {
        if self.cache_ts == 0 {
            return false;
        }
        unix_nanos().saturating_sub(self.cache_ts) <= info_age.as_nanos() as i64
    }
}

/// A directory record as stored in the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDirectory {
    pub path: String,
    pub mod_time: i64,
    #[serde(default)]
    pub child_count: Option<u64>,
    pub cache_ts: i64,
}

impl CachedDirectory {
    pub fn new(path: &str, mod_time: i64) -> Self {
        Self {
            path: normalize(path),
            mod_time,
            child_count: None,
            cache_ts: unix_nanos(),
        }
    }

    pub fn is_fresh(&self, info_age: Duration) -> bool {
        if self.cache_ts == 0 {
            return false;
        }
        unix_nanos().saturating_sub(self.cache_ts) <= info_age.as_nanos() as i64
    }
}

/// Chunk ledger entry, stored under its big-endian timestamp key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub path: String,
    pub offset: u64,
    pub size: u64,
}

/// Durable descriptor of a staged file awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub dest: String,
    /// Queue insertion time, unix nanoseconds.
    pub added_at: i64,
    #[serde(default)]
    pub started: bool,
}

impl PendingUpload {
    pub fn new(dest: &str) -> Self {
        Self {
            dest: normalize(dest),
            added_at: unix_nanos(),
            started: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStats {
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
    pub total_chunks: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub oldest_ts: Option<i64>,
    pub newest_ts: Option<i64>,
    pub total_dir: u64,
    pub total_files: u64,
}

/// Snapshot returned by the `stats` control command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub chunks: ChunkStats,
    pub files: FileStats,
}
