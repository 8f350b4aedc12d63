//! Control commands: targeted expiry, cache statistics and chunk
//! pre-warming.
//!
//! The `fetch` chunk spec is a comma-separated list of slice expressions
//! over a file's chunk count `C`: `n` fetches chunk `n`, `a:b` the chunks
//! in `[a, b)`, either bound may be omitted (defaulting to `0` and `C`) or
//! negative (counted from the end). Ranges that are empty after clamping
//! are skipped silently; malformed numbers are an error.

use std::collections::BTreeSet;

use anyhow::format_err;
use serde_json::json;

use blobcache_store::types::{self, CacheStats, ObjectInfo};

use crate::error::FsError;
use crate::fs::CacheFs;
use crate::limiter::DEFAULT_OPEN_WAIT;
use crate::remote::{EntryKind, RangeReader, RemoteFs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSlice {
    start: Option<i64>,
    end: Option<i64>,
    single: bool,
}

fn parse_bound(text: &str) -> Result<Option<i64>, FsError> {
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<i64>()
        .map(Some)
        .map_err(|_| FsError::Other(format_err!("invalid chunk index '{}'", text)))
}

fn parse_chunk_spec(spec: &str) -> Result<Vec<ChunkSlice>, FsError> {
    let mut slices = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        match part.split_once(':') {
            Some((start, end)) => slices.push(ChunkSlice {
                start: parse_bound(start)?,
                end: parse_bound(end)?,
                single: false,
            }),
            None => {
                let index = parse_bound(part)?
                    .ok_or_else(|| FsError::Other(format_err!("empty chunk index")))?;
                slices.push(ChunkSlice {
                    start: Some(index),
                    end: None,
                    single: true,
                });
            }
        }
    }
    Ok(slices)
}

/// Resolve one slice against a concrete chunk count; `None` when it clamps
/// to nothing.
fn resolve_slice(slice: &ChunkSlice, count: i64) -> Option<(u64, u64)> {
    let mut start = slice.start.unwrap_or(0);
    if start < 0 {
        start += count;
    }
    let mut end = if slice.single {
        start + 1
    } else {
        let mut end = slice.end.unwrap_or(count);
        if end < 0 {
            end += count;
        }
        end
    };

    start = start.clamp(0, count);
    end = end.clamp(0, count);
    if start >= end {
        return None;
    }
    Some((start as u64, end as u64))
}

impl CacheFs {
    /// Remove one object or directory from the cache; `with_data` also
    /// deletes the chunks.
    pub fn expire_remote(&self, remote: &str, with_data: bool) -> Result<(), FsError> {
        let path = types::normalize(remote);
        let inner = self.inner();

        if inner.meta.get_dir(&path)?.is_some() {
            inner.meta.expire_dir(&path)?;
            if with_data {
                inner.meta.wipe_chunks_within(&path)?;
                if let Some(memory) = &inner.memory {
                    memory.clear();
                }
            }
            inner.notifier.broadcast(&path, EntryKind::Dir);
            return Ok(());
        }

        if inner.meta.get_object(&path)?.is_some() {
            if let Some(memory) = &inner.memory {
                memory.remove_object(&path);
            }
            inner.meta.expire_object(&path, with_data)?;
            inner.notifier.broadcast(&path, EntryKind::Object);
            return Ok(());
        }

        Err(FsError::NotFound)
    }

    /// Snapshot of the chunk ledger and the file records.
    pub fn stats(&self) -> Result<CacheStats, FsError> {
        Ok(self.inner().meta.stats()?)
    }

    /// Run one janitor pass right now instead of waiting for the timer.
    pub fn clean_up(&self) -> Result<u64, FsError> {
        let inner = self.inner();
        let removed = inner.meta.clean_chunks_by_size(inner.config.chunk_total_size)?;
        if let Some(memory) = &inner.memory {
            memory.purge_expired(inner.config.chunk_clean_interval);
        }
        Ok(removed)
    }

    /// Pre-warm chunks of the given files. Returns a per-file summary of
    /// requested and freshly downloaded chunk counts.
    pub async fn fetch(
        &self,
        chunk_spec: &str,
        files: &[&str],
    ) -> Result<serde_json::Value, FsError> {
        let slices = parse_chunk_spec(chunk_spec)?;
        let chunk_size = self.inner().config.chunk_size;

        let mut report = serde_json::Map::new();
        for file in files {
            let object = self.new_object(file).await?;
            let count = ((object.info.size + chunk_size - 1) / chunk_size) as i64;

            let mut wanted: BTreeSet<u64> = BTreeSet::new();
            for slice in &slices {
                if let Some((start, end)) = resolve_slice(slice, count) {
                    wanted.extend(start..end);
                }
            }

            let mut fetched = 0usize;
            for index in &wanted {
                let offset = index * chunk_size;
                if self.inner().meta.chunk_store().has_chunk(&object.info.path, offset) {
                    continue;
                }
                self.fetch_chunk(&object.info, offset).await?;
                fetched += 1;
            }

            report.insert(
                object.info.path.clone(),
                json!({ "requested": wanted.len(), "fetched": fetched }),
            );
        }
        Ok(serde_json::Value::Object(report))
    }

    async fn fetch_chunk(&self, info: &ObjectInfo, offset: u64) -> Result<(), FsError> {
        let inner = self.inner();
        let end = (offset + inner.config.chunk_size).min(info.size);
        if offset >= end {
            return Ok(());
        }

        inner.gate.acquire(DEFAULT_OPEN_WAIT).await?;
        let source = self.read_source_for(&info.path)?;
        let mut reader = source.open(&info.path, offset).await?;

        let mut buf = vec![0u8; (end - offset) as usize];
        let mut read = 0usize;
        while read < buf.len() {
            match reader.read(&mut buf[read..]).await {
                Ok(0) => break,
                Ok(count) => read += count,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
        }
        buf.truncate(read);

        inner.meta.add_chunk(&info.path, offset, &buf)?;
        Ok(())
    }
}
