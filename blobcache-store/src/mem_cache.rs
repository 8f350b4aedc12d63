//! In-memory hot tier of the chunk cache.
//!
//! A plain map from `(path, offset)` to the chunk bytes. The tier is never
//! bounded by bytes; it is bounded implicitly by how far ahead the download
//! workers can run. Entries leave the map either when the reader has moved
//! past them (need-based eviction on re-anchor) or when the TTL sweep finds
//! them expired.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Default)]
pub struct MemCache {
    inner: Mutex<HashMap<(String, u64), (Bytes, Instant)>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, path: &str, offset: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .contains_key(&(path.to_owned(), offset))
    }

    /// Cloning `Bytes` is a refcount bump, the payload is shared with the
    /// stored entry.
    pub fn get(&self, path: &str, offset: u64) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .get(&(path.to_owned(), offset))
            .map(|(data, _)| data.clone())
    }

    pub fn put(&self, path: &str, offset: u64, data: Bytes) {
        self.inner
            .lock()
            .unwrap()
            .insert((path.to_owned(), offset), (data, Instant::now()));
    }

    /// Need-based eviction: the reader has advanced to `offset` on `path`,
    /// so everything before it on that object will not be read again.
    pub fn evict_before(&self, path: &str, offset: u64) {
        self.inner
            .lock()
            .unwrap()
            .retain(|(p, o), _| p != path || *o >= offset);
    }

    /// TTL sweep, driven by the janitor tick.
    pub fn purge_expired(&self, max_age: Duration) {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .retain(|_, (_, inserted)| now.duration_since(*inserted) < max_age);
    }

    pub fn remove_object(&self, path: &str) {
        self.inner.lock().unwrap().retain(|(p, _), _| p != path);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
