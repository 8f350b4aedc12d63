//! Per-open-file handle and its download worker pool.
//!
//! A handle serializes `read`/`seek` on `&mut self` and keeps a prefetch
//! window running ahead of the reader: every time the read position crosses
//! into a new chunk the next `W` chunk-start offsets are enqueued on a
//! buffered preload queue. Each worker owns at most one open range reader
//! so sequential chunks reuse the same source connection, and lands
//! finished chunks in the memory tier and the chunk store. `read` itself
//! only blocks when the chunk it needs has not been materialized yet,
//! polling the two tiers at a fixed interval while the workers catch up.

use std::collections::HashSet;
use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::format_err;
use bytes::Bytes;
use futures::ready;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use blobcache_store::types::{CachedObject, ObjectInfo};
use blobcache_store::{MemCache, MetaStore};

use crate::error::FsError;
use crate::limiter::{OpenGate, DEFAULT_OPEN_WAIT};
use crate::remote::{RangeReader, RemoteFs};

/// How often `read` re-checks the tiers for a chunk in flight.
const CHUNK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Optional signal from an upstream consumer used to scale the worker
/// pool: while no external consumer is active a handle idles on a single
/// worker and only spreads out once real streaming begins.
pub trait ReaderHint: Send + Sync {
    fn active(&self) -> bool;
}

struct HandleShared {
    path: String,
    info: Mutex<ObjectInfo>,
    source: Arc<dyn RemoteFs>,
    meta: Arc<MetaStore>,
    memory: Option<Arc<MemCache>>,
    gate: Arc<OpenGate>,
    chunk_size: u64,
    read_retries: u32,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<i64>>,
}

impl HandleShared {
    fn size(&self) -> u64 {
        self.info.lock().unwrap().size
    }

    /// Re-fetch object metadata after a source hiccup; the source may have
    /// replaced the object under us.
    async fn refresh_info(&self) {
        match self.source.new_object(&self.path).await {
            Ok(info) => {
                *self.info.lock().unwrap() = info.clone();
                if let Err(err) = self.meta.add_object(&CachedObject::new(info)) {
                    log::warn!("storing refreshed metadata for '{}' failed - {}", self.path, err);
                }
            }
            Err(err) => {
                log::debug!("refreshing metadata for '{}' failed - {}", self.path, err);
            }
        }
    }
}

pub struct ObjectHandle {
    shared: Arc<HandleShared>,
    queue_tx: Option<mpsc::Sender<i64>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
    target_workers: usize,
    offset: u64,
    /// Last prefetch anchor; -1 until the first enqueue.
    preload_offset: i64,
    /// Offsets enqueued since the last re-anchor.
    queued: HashSet<u64>,
    read_seen: bool,
    closed: bool,
    hint: Option<Arc<dyn ReaderHint>>,
}

impl ObjectHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        info: ObjectInfo,
        source: Arc<dyn RemoteFs>,
        meta: Arc<MetaStore>,
        memory: Option<Arc<MemCache>>,
        gate: Arc<OpenGate>,
        chunk_size: u64,
        workers: usize,
        read_retries: u32,
        hint: Option<Arc<dyn ReaderHint>>,
    ) -> Self {
        let target_workers = workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(target_workers * 10);

        let shared = Arc::new(HandleShared {
            path: info.path.clone(),
            info: Mutex::new(info),
            source,
            meta,
            memory,
            gate,
            chunk_size,
            read_retries,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        });

        let mut handle = Self {
            shared,
            queue_tx: Some(queue_tx),
            workers: Vec::new(),
            worker_count: 0,
            target_workers,
            offset: 0,
            preload_offset: -1,
            queued: HashSet::new(),
            read_seen: false,
            closed: false,
            hint,
        };

        // with a hint and no active consumer, idle on one worker
        let initial = match &handle.hint {
            Some(hint) if !hint.active() => 1,
            _ => target_workers,
        };
        handle.scale_workers(initial);
        handle
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn size(&self) -> u64 {
        self.shared.size()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn check_hint(&mut self) {
        if let Some(hint) = &self.hint {
            if hint.active() && self.worker_count < self.target_workers {
                self.scale_workers(self.target_workers);
            }
        }
    }

    /// Grow by spawning fresh workers, shrink by pushing one negative
    /// sentinel per surplus worker. The first upscale from zero stays
    /// silent.
    fn scale_workers(&mut self, count: usize) {
        let count = count.min(self.target_workers);
        if count == self.worker_count {
            return;
        }
        if count < self.worker_count {
            if let Some(tx) = &self.queue_tx {
                for _ in count..self.worker_count {
                    let _ = tx.try_send(-1);
                }
            }
        } else {
            if self.worker_count > 0 {
                log::debug!("'{}': scaling workers to {}", self.shared.path, count);
            }
            for _ in self.worker_count..count {
                self.workers
                    .push(tokio::spawn(worker_loop(Arc::clone(&self.shared))));
            }
        }
        self.worker_count = count;
    }

    /// Re-seed the prefetch window when the anchor moves: evict the memory
    /// tier behind the reader, re-check the external-reader hint, drop
    /// stale enqueue marks and push the next `W` in-range chunk offsets.
    async fn queue_offset(&mut self, chunk_start: u64) {
        if chunk_start as i64 == self.preload_offset {
            return;
        }

        if let Some(memory) = &self.shared.memory {
            memory.evict_before(&self.shared.path, chunk_start);
        }
        self.check_hint();
        self.queued.retain(|offset| *offset >= chunk_start);

        let size = self.shared.size();
        for slot in 0..self.worker_count.max(1) {
            let offset = chunk_start + slot as u64 * self.shared.chunk_size;
            if offset >= size {
                break;
            }
            if self.queued.contains(&offset) {
                continue;
            }
            let tx = match &self.queue_tx {
                Some(tx) => tx,
                None => break,
            };
            if tx.send(offset as i64).await.is_err() {
                break;
            }
            self.queued.insert(offset);
        }

        self.preload_offset = chunk_start as i64;
    }

    async fn wait_for_chunk(&self, offset: u64) -> Result<Bytes, FsError> {
        let attempts = (self.shared.read_retries as u64 * 8).max(1);
        for attempt in 0..attempts {
            if let Some(memory) = &self.shared.memory {
                if let Some(data) = memory.get(&self.shared.path, offset) {
                    return Ok(data);
                }
            }
            if let Some(data) = self
                .shared
                .meta
                .chunk_store()
                .get_chunk(&self.shared.path, offset)
            {
                if let Some(memory) = &self.shared.memory {
                    memory.put(&self.shared.path, offset, data.clone());
                }
                return Ok(data);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(CHUNK_POLL_INTERVAL).await;
            }
        }

        log::error!(
            "'{}': chunk at {} not found after {} attempts",
            self.shared.path,
            offset,
            attempts
        );
        if self.worker_count > 0 {
            Err(FsError::ChunkMiss)
        } else {
            Err(FsError::ChunkNotFound)
        }
    }

    /// Read at the current position. `Ok(0)` is EOF. A short count simply
    /// means the read stopped at a chunk boundary.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.closed {
            return Err(FsError::AlreadyClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.shared.size();
        if self.offset >= size {
            return Ok(0);
        }
        if !self.read_seen {
            self.read_seen = true;
            self.check_hint();
        }

        let chunk_start = self.offset - self.offset % self.shared.chunk_size;
        let inner = (self.offset - chunk_start) as usize;

        self.queue_offset(chunk_start).await;
        let data = self.wait_for_chunk(chunk_start).await?;

        if inner >= data.len() {
            // chunk was truncated by EOF on the source side
            return Ok(0);
        }
        let count = buf.len().min(data.len() - inner);
        buf[..count].copy_from_slice(&data[inner..inner + count]);
        self.offset += count as u64;
        Ok(count)
    }

    /// Reposition the handle and warm up one chunk before the new
    /// position. Seeking past EOF is allowed; the next read returns EOF
    /// without fetching anything.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, FsError> {
        if self.closed {
            return Err(FsError::AlreadyClosed);
        }
        let size = self.shared.size();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => size as i64 + delta,
            SeekFrom::Current(delta) => self.offset as i64 + delta,
        };
        if target < 0 {
            return Err(FsError::Other(format_err!("cannot seek to negative offset")));
        }
        self.offset = target as u64;

        if self.offset < size {
            let aligned = self.offset - self.offset % self.shared.chunk_size;
            self.queue_offset(aligned.saturating_sub(self.shared.chunk_size))
                .await;
        }
        Ok(self.offset)
    }

    /// Close the preload queue, wait for all workers and flush this
    /// object's memory-tier entries. A second close returns
    /// [FsError::AlreadyClosed].
    pub async fn close(&mut self) -> Result<(), FsError> {
        if self.closed {
            return Err(FsError::AlreadyClosed);
        }
        self.closed = true;
        self.queue_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.worker_count = 0;
        if let Some(memory) = &self.shared.memory {
            memory.remove_object(&self.shared.path);
        }
        Ok(())
    }

    /// Adapter implementing `AsyncRead`/`AsyncSeek` for interfaces that
    /// need them. Direct use of `read` is preferred otherwise.
    pub fn seekable(self) -> SeekableObjectReader {
        SeekableObjectReader::new(self)
    }
}

// Dropping an unclosed handle closes the queue, which lets the workers
// drain and exit on their own; only close() waits for them.

async fn worker_loop(shared: Arc<HandleShared>) {
    let mut reader: Option<Box<dyn RangeReader>> = None;
    let mut reader_pos: u64 = 0;

    loop {
        let item = {
            let mut rx = shared.queue_rx.lock().await;
            rx.recv().await
        };
        let offset = match item {
            None => break,               // queue closed
            Some(offset) if offset < 0 => break, // scale-down sentinel
            Some(offset) => offset as u64,
        };

        if let Some(memory) = &shared.memory {
            if memory.has(&shared.path, offset) {
                continue;
            }
            if let Some(data) = shared.meta.chunk_store().get_chunk(&shared.path, offset) {
                // promote from disk, no download needed
                memory.put(&shared.path, offset, data);
                continue;
            }
        } else if shared.meta.chunk_store().has_chunk(&shared.path, offset) {
            continue;
        }

        download_chunk(&shared, &mut reader, &mut reader_pos, offset).await;
    }
}

/// Fetch one chunk with up to `read_retries` attempts and linear back-off.
/// The worker's reader is reused via range-seek when it already sits at
/// the right position; any retry forces a reopen through the rate limiter.
async fn download_chunk(
    shared: &HandleShared,
    reader: &mut Option<Box<dyn RangeReader>>,
    reader_pos: &mut u64,
    start: u64,
) {
    let end = (start + shared.chunk_size).min(shared.size());
    if start >= end {
        return;
    }

    let mut retry: u32 = 0;
    loop {
        if retry >= shared.read_retries {
            // give up silently, a later read re-enqueues the chunk
            log::debug!(
                "'{}': giving up on chunk at {} after {} retries",
                shared.path,
                start,
                retry
            );
            *reader = None;
            return;
        }
        if retry > 0 {
            tokio::time::sleep(Duration::from_secs(retry as u64)).await;
        }

        let mut positioned = false;
        if retry == 0 {
            if let Some(r) = reader.as_mut() {
                if *reader_pos == start {
                    positioned = true;
                } else {
                    positioned = r.seek_to(start).await.unwrap_or(false);
                    if positioned {
                        *reader_pos = start;
                    }
                }
            }
        }

        if !positioned {
            *reader = None;
            if let Err(err) = shared.gate.acquire(DEFAULT_OPEN_WAIT).await {
                log::debug!("'{}': rate limiter gate failed - {}", shared.path, err);
                return;
            }
            match shared.source.open(&shared.path, start).await {
                Ok(r) => {
                    *reader = Some(r);
                    *reader_pos = start;
                }
                Err(err) => {
                    log::warn!("'{}': open at {} failed - {}", shared.path, start, err);
                    shared.refresh_info().await;
                    retry += 1;
                    continue;
                }
            }
        }

        let r = match reader.as_mut() {
            Some(r) => r,
            None => return,
        };

        let mut buf = vec![0u8; (end - start) as usize];
        let mut read = 0usize;
        let mut failed = false;
        while read < buf.len() {
            match r.read(&mut buf[read..]).await {
                Ok(0) => break, // EOF, keep the truncated chunk
                Ok(count) => read += count,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => {
                    log::warn!("'{}': read at {} failed - {}", shared.path, start, err);
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            *reader = None;
            shared.refresh_info().await;
            retry += 1;
            continue;
        }

        buf.truncate(read);
        *reader_pos = start + read as u64;

        let data = Bytes::from(buf);
        if let Some(memory) = &shared.memory {
            memory.put(&shared.path, start, data.clone());
        }
        if let Err(err) = shared.meta.add_chunk(&shared.path, start, &data) {
            log::warn!("'{}': storing chunk at {} failed - {}", shared.path, start, err);
        }
        return;
    }
}

type ReadFuture =
    Pin<Box<dyn Future<Output = (ObjectHandle, Result<(Vec<u8>, usize), FsError>)> + Send>>;
type SeekFuture = Pin<Box<dyn Future<Output = (ObjectHandle, Result<u64, FsError>)> + Send>>;

enum PendingOp {
    Read(ReadFuture),
    Seek(SeekFuture),
}

/// `AsyncRead`/`AsyncSeek` view of an [ObjectHandle].
///
/// The handle is moved into the in-flight future and handed back on
/// completion, so the borrow never outlives a poll.
pub struct SeekableObjectReader {
    handle: Option<ObjectHandle>,
    position: u64,
    pending: Option<PendingOp>,
}

impl SeekableObjectReader {
    fn new(handle: ObjectHandle) -> Self {
        let position = handle.offset();
        Self {
            handle: Some(handle),
            position,
            pending: None,
        }
    }

    /// Close the underlying handle. Fails with [FsError::AlreadyClosed] on
    /// the second call, like [ObjectHandle::close].
    pub async fn close(&mut self) -> Result<(), FsError> {
        match self.handle.as_mut() {
            Some(handle) => handle.close().await,
            None => Err(FsError::AlreadyClosed),
        }
    }

    fn state_error() -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            "object reader lost its handle to a failed operation",
        )
    }
}

impl AsyncRead for SeekableObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<std::io::Result<()>> {
        let this = Pin::get_mut(self);

        loop {
            match this.pending.as_mut() {
                None => {
                    let mut handle = match this.handle.take() {
                        Some(handle) => handle,
                        None => return Poll::Ready(Err(Self::state_error())),
                    };
                    let wanted = buf.remaining();
                    this.pending = Some(PendingOp::Read(Box::pin(async move {
                        let mut data = vec![0u8; wanted];
                        let result = handle.read(&mut data).await;
                        (handle, result.map(|count| (data, count)))
                    })));
                }
                Some(PendingOp::Read(fut)) => {
                    let (handle, result) = ready!(fut.as_mut().poll(cx));
                    this.handle = Some(handle);
                    this.pending = None;
                    return Poll::Ready(match result {
                        Ok((data, count)) => {
                            buf.put_slice(&data[..count]);
                            this.position += count as u64;
                            Ok(())
                        }
                        Err(err) => Err(err.into()),
                    });
                }
                Some(PendingOp::Seek(fut)) => {
                    // finish the seek first
                    let (handle, result) = ready!(fut.as_mut().poll(cx));
                    this.handle = Some(handle);
                    this.pending = None;
                    match result {
                        Ok(position) => this.position = position,
                        Err(err) => return Poll::Ready(Err(err.into())),
                    }
                }
            }
        }
    }
}

impl AsyncSeek for SeekableObjectReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = Pin::get_mut(self);
        if this.pending.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "another operation is in flight",
            ));
        }
        let mut handle = this.handle.take().ok_or_else(Self::state_error)?;
        this.pending = Some(PendingOp::Seek(Box::pin(async move {
            let result = handle.seek(position).await;
            (handle, result)
        })));
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context) -> Poll<std::io::Result<u64>> {
        let this = Pin::get_mut(self);
        match this.pending.as_mut() {
            Some(PendingOp::Seek(fut)) => {
                let (handle, result) = ready!(fut.as_mut().poll(cx));
                this.handle = Some(handle);
                this.pending = None;
                match result {
                    Ok(position) => {
                        this.position = position;
                        Poll::Ready(Ok(position))
                    }
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
            _ => Poll::Ready(Ok(this.position)),
        }
    }
}
