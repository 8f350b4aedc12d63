#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use blobcache::remote::{
    AboutInfo, ChangeEvent, DataStream, Entry, EntryKind, Features, LocalFs, RangeReader, RemoteFs,
};
use blobcache::{CacheConfig, CacheFs, FsError, ObjectInfo};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config pointed at a scratch dir, sized for fast tests.
pub fn test_config(cache_dir: &Path, chunk_size: u64, workers: usize) -> CacheConfig {
    CacheConfig {
        cache_dir: cache_dir.to_path_buf(),
        chunk_size,
        chunk_total_size: chunk_size * workers as u64 * 64,
        workers,
        read_retries: 3,
        ..CacheConfig::default()
    }
}

pub fn byte_stream(data: Vec<u8>) -> DataStream {
    Box::new(std::io::Cursor::new(data))
}

/// Deterministic pseudo-random content.
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

pub async fn put_bytes(fs: &CacheFs, path: &str, data: &[u8]) {
    fs.put(path, byte_stream(data.to_vec()), 0).await.unwrap();
}

pub async fn read_all(fs: &CacheFs, path: &str) -> Vec<u8> {
    let mut handle = fs.open(path).await.unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = handle.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    handle.close().await.unwrap();
    out
}

/// A [LocalFs] that also delivers change notifications injected by the
/// test, standing in for a source with native change support.
pub struct NotifyFs {
    inner: LocalFs,
    changes: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
}

impl NotifyFs {
    pub fn new(name: &str, root: &Path) -> Self {
        Self {
            inner: LocalFs::new(name, root).unwrap(),
            changes: Mutex::new(None),
        }
    }

    pub fn notify(&self, path: &str, kind: EntryKind) {
        let sender = self.changes.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            sender.try_send(ChangeEvent {
                path: path.to_owned(),
                kind,
            })
            .unwrap();
        }
    }
}

#[async_trait]
impl RemoteFs for NotifyFs {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn features(&self) -> Features {
        Features {
            change_notify: true,
            ..self.inner.features()
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, FsError> {
        self.inner.list(dir).await
    }

    async fn new_object(&self, remote: &str) -> Result<ObjectInfo, FsError> {
        self.inner.new_object(remote).await
    }

    async fn open(&self, remote: &str, offset: u64) -> Result<Box<dyn RangeReader>, FsError> {
        self.inner.open(remote, offset).await
    }

    async fn put(
        &self,
        remote: &str,
        data: DataStream,
        mod_time: i64,
    ) -> Result<ObjectInfo, FsError> {
        self.inner.put(remote, data, mod_time).await
    }

    async fn delete(&self, remote: &str) -> Result<(), FsError> {
        self.inner.delete(remote).await
    }

    async fn mkdir(&self, dir: &str) -> Result<(), FsError> {
        self.inner.mkdir(dir).await
    }

    async fn rmdir(&self, dir: &str) -> Result<(), FsError> {
        self.inner.rmdir(dir).await
    }

    async fn move_object(&self, src: &str, dest: &str) -> Result<ObjectInfo, FsError> {
        self.inner.move_object(src, dest).await
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<ObjectInfo, FsError> {
        self.inner.copy_object(src, dest).await
    }

    async fn dir_move(&self, src: &str, dest: &str) -> Result<(), FsError> {
        self.inner.dir_move(src, dest).await
    }

    async fn purge(&self, dir: &str) -> Result<(), FsError> {
        self.inner.purge(dir).await
    }

    async fn about(&self) -> Result<AboutInfo, FsError> {
        self.inner.about().await
    }

    fn subscribe_changes(&self, _interval: Duration) -> Option<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(16);
        *self.changes.lock().unwrap() = Some(tx);
        Some(rx)
    }
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
