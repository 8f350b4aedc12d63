//! The wrapped-FS contract.
//!
//! The cache fronts anything implementing [RemoteFs]. Only the core
//! operations are mandatory; everything else is an optional capability
//! advertised through [Features] and probed once at startup. Optional
//! operations default to [FsError::NotSupported], so a source only
//! implements what it genuinely supports and the cache degrades around the
//! rest.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use blobcache_store::types::ObjectInfo;

use crate::error::FsError;

pub mod local;

pub use local::LocalFs;

/// Byte stream handed to [RemoteFs::put].
pub type DataStream = Box<dyn AsyncRead + Send + Unpin>;

/// What kind of entry a change notification or broadcast refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Dir,
}

/// An upstream change event: `path` changed out-of-band on the source.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: EntryKind,
}

/// Directory metadata as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    pub path: String,
    pub mod_time: i64,
    pub child_count: Option<u64>,
}

/// One listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir(DirInfo),
    Object(ObjectInfo),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::Dir(dir) => &dir.path,
            Entry::Object(object) => &object.path,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Dir(_) => EntryKind::Dir,
            Entry::Object(_) => EntryKind::Object,
        }
    }
}

/// Optional capabilities of a remote, probed at startup and propagated
/// outward only where the cache can honor them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub list_r: bool,
    pub can_move: bool,
    pub can_copy: bool,
    pub can_dir_move: bool,
    pub can_purge: bool,
    pub about: bool,
    pub change_notify: bool,
    pub put_stream: bool,
}

/// Usage information returned by [RemoteFs::about].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutInfo {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
}

/// A reader positioned inside one remote object.
///
/// Workers keep one of these open across chunk downloads to amortize the
/// range-open cost. `seek_to` repositions in place where the remote
/// protocol allows it; `Ok(false)` tells the caller to reopen instead.
#[async_trait]
pub trait RangeReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    async fn seek_to(&mut self, _offset: u64) -> Result<bool, FsError> {
        Ok(false)
    }
}

/// The source FS capability set consumed by the cache.
#[async_trait]
pub trait RemoteFs: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn features(&self) -> Features;

    /// List the direct children of `dir`. Fails with [FsError::NotFound]
    /// for a missing directory and [FsError::IsFile] when `dir` names an
    /// object.
    async fn list(&self, dir: &str) -> Result<Vec<Entry>, FsError>;

    /// Recursive listing; only called when `features().list_r` is set.
    async fn list_recursive(&self, _dir: &str) -> Result<Vec<Entry>, FsError> {
        Err(FsError::NotSupported)
    }

    /// Object metadata lookup by remote path.
    async fn new_object(&self, remote: &str) -> Result<ObjectInfo, FsError>;

    /// Open a reader at byte `offset` of `remote`.
    async fn open(&self, remote: &str, offset: u64) -> Result<Box<dyn RangeReader>, FsError>;

    /// Store an object, replacing any previous one, and return its final
    /// metadata. The returned metadata is authoritative.
    async fn put(
        &self,
        remote: &str,
        data: DataStream,
        mod_time: i64,
    ) -> Result<ObjectInfo, FsError>;

    async fn delete(&self, remote: &str) -> Result<(), FsError>;

    async fn mkdir(&self, dir: &str) -> Result<(), FsError>;

    /// Remove an empty directory; [FsError::DirNotEmpty] otherwise.
    async fn rmdir(&self, dir: &str) -> Result<(), FsError>;

    /// Server-side move; only called when `features().can_move` is set.
    async fn move_object(&self, _src: &str, _dest: &str) -> Result<ObjectInfo, FsError> {
        Err(FsError::NotSupported)
    }

    /// Server-side copy; only called when `features().can_copy` is set.
    async fn copy_object(&self, _src: &str, _dest: &str) -> Result<ObjectInfo, FsError> {
        Err(FsError::NotSupported)
    }

    /// Server-side directory move; gated by `features().can_dir_move`.
    async fn dir_move(&self, _src: &str, _dest: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Recursive delete; gated by `features().can_purge`.
    async fn purge(&self, _dir: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    async fn about(&self) -> Result<AboutInfo, FsError> {
        Err(FsError::NotSupported)
    }

    /// Subscribe to out-of-band change notifications, polled at
    /// `interval`. `None` when the remote cannot provide them; the cache
    /// then synthesizes events from its own mutating calls.
    fn subscribe_changes(&self, _interval: Duration) -> Option<mpsc::Receiver<ChangeEvent>> {
        None
    }

    async fn shutdown(&self) -> Result<(), FsError> {
        Ok(())
    }
}
