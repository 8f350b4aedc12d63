mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobcache::remote::{EntryKind, LocalFs};
use blobcache::{CacheConfig, CacheFs};

use common::{init_logging, pattern, put_bytes, read_all, test_config, wait_for, NotifyFs};

#[tokio::test]
async fn change_notification_invalidates_object_and_data() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source_root = dir.path().join("source");
    let source = Arc::new(NotifyFs::new("source", &source_root));
    let source_fs = Arc::clone(&source);

    let config = CacheConfig {
        info_age: Duration::from_secs(24 * 3600),
        ..test_config(&dir.path().join("cache"), 16 * 1024, 2)
    };
    let fs = CacheFs::new("inval-notify", source, config).unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    let observed_in_cb = Arc::clone(&observed);
    fs.subscribe(Box::new(move |path, _kind| {
        if path == "watched.bin" {
            observed_in_cb.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let content = pattern(40 * 1024);
    put_bytes(&fs, "watched.bin", &content).await;
    fs.list("").await.unwrap();
    assert_eq!(read_all(&fs, "watched.bin").await, content);
    assert!(fs.stats().unwrap().chunks.total_chunks > 0);

    // the object shrinks behind the cache's back
    std::fs::write(source_root.join("watched.bin"), b"rewritten").unwrap();
    // well inside the 24h TTL, the cache still serves the stale record
    assert_eq!(
        fs.new_object("watched.bin").await.unwrap().info.size,
        content.len() as u64
    );

    source_fs.notify("watched.bin", EntryKind::Object);

    let fs_poll = fs.clone();
    assert!(
        wait_for(Duration::from_secs(5), move || {
            fs_poll.stats().map_or(false, |s| s.chunks.total_chunks == 0)
        })
        .await,
        "chunks were not dropped"
    );
    assert!(observed.load(Ordering::SeqCst) >= 1, "subscriber missed the event");

    // the expired record forces a refresh from the source
    let fresh = fs.new_object("watched.bin").await.unwrap();
    assert_eq!(fresh.info.size, 9);
    assert_eq!(read_all(&fs, "watched.bin").await, b"rewritten");

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn expired_listing_reconciles_against_source() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source_root = dir.path().join("source");
    let source = Arc::new(LocalFs::new("source", &source_root).unwrap());
    let fs = CacheFs::new(
        "inval-list",
        source,
        test_config(&dir.path().join("cache"), 16 * 1024, 2),
    )
    .unwrap();

    put_bytes(&fs, "d/keep.bin", b"keep").await;
    put_bytes(&fs, "d/drop.bin", b"drop").await;
    assert_eq!(fs.list("d").await.unwrap().len(), 2);

    // out-of-band: one object disappears, a new one appears
    std::fs::remove_file(source_root.join("d/drop.bin")).unwrap();
    std::fs::write(source_root.join("d/new.bin"), b"new").unwrap();

    // the cached listing is still fresh and unchanged
    assert_eq!(fs.list("d").await.unwrap().len(), 2);

    fs.expire_remote("d", false).unwrap();
    let rebuilt = fs.list("d").await.unwrap();
    let names: Vec<&str> = rebuilt.iter().map(|e| e.path()).collect();
    assert_eq!(names, ["d/keep.bin", "d/new.bin"]);

    // the removed child is gone for direct lookup too
    assert!(fs.new_object("d/drop.bin").await.is_err());
    assert!(fs.new_object("d/new.bin").await.is_ok());

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn mkdir_rmdir_leaves_no_trace() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(LocalFs::new("source", dir.path().join("source")).unwrap());
    let fs = CacheFs::new(
        "inval-mkdir",
        source,
        test_config(&dir.path().join("cache"), 16 * 1024, 1),
    )
    .unwrap();

    let before = fs.stats().unwrap().files.total_dir;
    fs.mkdir("ephemeral").await.unwrap();
    assert_eq!(fs.stats().unwrap().files.total_dir, before + 1);

    fs.rmdir("ephemeral").await.unwrap();
    assert_eq!(fs.stats().unwrap().files.total_dir, before);
    assert!(!fs
        .list("")
        .await
        .unwrap()
        .iter()
        .any(|e| e.path() == "ephemeral"));

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn mutating_calls_synthesize_notifications() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(LocalFs::new("source", dir.path().join("source")).unwrap());
    let fs = CacheFs::new(
        "inval-synth",
        source,
        test_config(&dir.path().join("cache"), 16 * 1024, 1),
    )
    .unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_cb = Arc::clone(&seen);
    fs.subscribe(Box::new(move |path, kind| {
        seen_in_cb.lock().unwrap().push((path.to_owned(), kind));
    }));

    put_bytes(&fs, "n/obj.bin", b"x").await;
    fs.remove("n/obj.bin").await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&("n/obj.bin".to_owned(), EntryKind::Object)));
    assert!(seen.contains(&("n".to_owned(), EntryKind::Dir)));

    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn dir_cache_flush_forces_refetch() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let source_root = dir.path().join("source");
    let source = Arc::new(LocalFs::new("source", &source_root).unwrap());
    let fs = CacheFs::new(
        "inval-flush",
        source,
        test_config(&dir.path().join("cache"), 16 * 1024, 1),
    )
    .unwrap();

    put_bytes(&fs, "f/a.bin", b"a").await;
    fs.list("f").await.unwrap();

    std::fs::write(source_root.join("f/b.bin"), b"b").unwrap();
    // still the cached view
    assert_eq!(fs.list("f").await.unwrap().len(), 1);

    fs.dir_cache_flush().unwrap();
    assert_eq!(fs.list("f").await.unwrap().len(), 2);

    fs.shutdown().await.unwrap();
}
