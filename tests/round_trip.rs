mod common;

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use blobcache::remote::{Entry, LocalFs};
use blobcache::{CacheFs, FsError};

use common::{byte_stream, init_logging, pattern, put_bytes, read_all, test_config, wait_for};

fn new_cache(name: &str, dir: &tempfile::TempDir, chunk_size: u64, workers: usize) -> CacheFs {
    let source = Arc::new(LocalFs::new("source", dir.path().join("source")).unwrap());
    CacheFs::new(
        name,
        source,
        test_config(&dir.path().join("cache"), chunk_size, workers),
    )
    .unwrap()
}

#[tokio::test]
async fn small_object_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let fs = new_cache("rt-small", &dir, 5 * 1024 * 1024, 1);

    put_bytes(&fs, "hello.txt", b"hello").await;

    let entries = fs.list("").await.unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        Entry::Object(info) => {
            assert_eq!(info.path, "hello.txt");
            assert_eq!(info.size, 5);
        }
        other => panic!("expected an object entry, got {:?}", other),
    }

    assert_eq!(read_all(&fs, "hello.txt").await, b"hello");

    // exactly one ledger entry: offset 0, size 5
    let stats = fs.stats().unwrap();
    assert_eq!(stats.chunks.total_chunks, 1);
    assert_eq!(stats.chunks.total_size, 5);

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn sequential_prefetch_reproduces_content() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let chunk = 256 * 1024u64;
    let fs = new_cache("rt-prefetch", &dir, chunk, 4);

    let content = pattern(2 * 1024 * 1024 + 12345);
    put_bytes(&fs, "media/video.bin", &content).await;

    let mut handle = fs.open("media/video.bin").await.unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; 100 * 1024];
    let n = handle.read(&mut buf).await.unwrap();
    out.extend_from_slice(&buf[..n]);

    // the workers run ahead: some chunk past the cursor materializes
    // without any further read
    let fs2 = fs.clone();
    let ahead = wait_for(Duration::from_secs(5), move || {
        fs2.stats().map_or(false, |s| s.chunks.total_chunks > 1)
    })
    .await;
    assert!(ahead, "no prefetched chunk appeared");

    loop {
        let n = handle.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    handle.close().await.unwrap();
    assert_eq!(out, content);

    let expected_chunks = (content.len() as u64 + chunk - 1) / chunk;
    let stats = fs.stats().unwrap();
    assert_eq!(stats.chunks.total_chunks, expected_chunks);
    assert_eq!(stats.chunks.total_size, content.len() as u64);

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn put_new_object_open_read_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let fs = new_cache("rt-full", &dir, 64 * 1024, 2);

    let content = pattern(200 * 1024);
    put_bytes(&fs, "a/b/data.bin", &content).await;

    let listed = fs.list("a/b").await.unwrap();
    assert!(listed.iter().any(|e| e.path() == "a/b/data.bin"));

    let object = fs.new_object("a/b/data.bin").await.unwrap();
    assert_eq!(object.info.size, content.len() as u64);

    assert_eq!(read_all(&fs, "a/b/data.bin").await, content);
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_through_tee_stores_chunks() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(LocalFs::new("source", dir.path().join("source")).unwrap());
    let mut config = test_config(&dir.path().join("cache"), 64 * 1024, 2);
    config.store_writes = true;
    let fs = CacheFs::new("rt-tee", source, config).unwrap();

    let content = pattern(3 * 64 * 1024 + 17);
    put_bytes(&fs, "teed.bin", &content).await;

    // all four chunks are present without a single read
    let stats = fs.stats().unwrap();
    assert_eq!(stats.chunks.total_chunks, 4);
    assert_eq!(stats.chunks.total_size, content.len() as u64);

    assert_eq!(read_all(&fs, "teed.bin").await, content);
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn chunk_boundaries_and_eof() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let chunk = 16 * 1024u64;
    let fs = new_cache("rt-bounds", &dir, chunk, 2);

    // strictly smaller than one chunk
    let small = pattern(100);
    put_bytes(&fs, "small.bin", &small).await;
    assert_eq!(read_all(&fs, "small.bin").await, small);
    let stats = fs.stats().unwrap();
    assert_eq!(stats.chunks.total_chunks, 1);

    // exact multiple of the chunk size: the last chunk is full-sized
    let exact = pattern(2 * chunk as usize);
    put_bytes(&fs, "exact.bin", &exact).await;
    assert_eq!(read_all(&fs, "exact.bin").await, exact);

    let mut handle = fs.open("exact.bin").await.unwrap();
    handle.seek(SeekFrom::Start(2 * chunk)).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(handle.read(&mut buf).await.unwrap(), 0, "read past end is EOF");

    // seek far past EOF reads EOF immediately, no chunk fetched
    let before = fs.stats().unwrap().chunks.total_chunks;
    handle.seek(SeekFrom::Start(100 * chunk)).await.unwrap();
    assert_eq!(handle.read(&mut buf).await.unwrap(), 0);
    assert_eq!(fs.stats().unwrap().chunks.total_chunks, before);

    handle.close().await.unwrap();
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn put_replaces_cached_object() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let fs = new_cache("rt-replace", &dir, 16 * 1024, 1);

    put_bytes(&fs, "f.bin", b"first version").await;
    assert_eq!(read_all(&fs, "f.bin").await, b"first version");

    fs.put("f.bin", byte_stream(b"second".to_vec()), 0)
        .await
        .unwrap();

    // the fresh object is visible immediately, old chunks are gone
    let object = fs.new_object("f.bin").await.unwrap();
    assert_eq!(object.info.size, 6);
    assert_eq!(read_all(&fs, "f.bin").await, b"second");

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn fetch_prewarms_chunks() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let chunk = 16 * 1024u64;
    let fs = new_cache("rt-fetch", &dir, chunk, 2);

    let content = pattern(5 * chunk as usize);
    put_bytes(&fs, "warm.bin", &content).await;

    let report = fs.fetch("0,2:4,-1", &["warm.bin"]).await.unwrap();
    assert_eq!(report["warm.bin"]["fetched"], 4);

    let stats = fs.stats().unwrap();
    assert_eq!(stats.chunks.total_chunks, 4);

    // re-fetching is a no-op
    let report = fs.fetch("0,2:4,-1", &["warm.bin"]).await.unwrap();
    assert_eq!(report["warm.bin"]["fetched"], 0);

    assert!(matches!(
        fs.fetch("nonsense", &["warm.bin"]).await,
        Err(FsError::Other(_))
    ));

    fs.shutdown().await.unwrap();
}
