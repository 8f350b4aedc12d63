//! Embedded transactional metadata store.
//!
//! One redb file holds four tables:
//!
//! * `dirs` - directory records keyed by normalized path
//! * `objects` - per-child object records keyed by normalized path
//! * `chunk_ts` - the chunk ledger, keyed by a strictly increasing
//!   nanosecond timestamp; values are serialized [ChunkRef]s. Key order is
//!   insertion order, which gives the janitor its approximate
//!   LRU-by-last-write eviction walk.
//! * `pending` - durable upload queue entries keyed by destination path
//!
//! redb serializes writers and gives readers MVCC snapshots, which is
//! exactly the single-writer discipline the cache needs: a listing
//! reconciliation lands in one transaction, and `expire_dir` updates a
//! directory and all its ancestors without partial expiry ever being
//! observable.
//!
//! The store exclusively owns its file. Opening the same file twice within
//! one process returns the existing instance from a process-wide registry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};

use crate::chunk_store::ChunkStore;
use crate::types::{
    self, CacheStats, CachedDirectory, CachedObject, ChunkRef, ChunkStats, FileStats,
    PendingUpload,
};

const DIRS: TableDefinition<&str, &[u8]> = TableDefinition::new("dirs");
const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");
const CHUNK_TS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunk_ts");
const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");

/// The metadata store could not be locked within the caller's wait budget.
#[derive(Debug)]
pub struct StoreBusy(pub PathBuf);

impl fmt::Display for StoreBusy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "metadata store {:?} is locked by another instance", self.0)
    }
}

impl std::error::Error for StoreBusy {}

lazy_static! {
    static ref STORE_MAP: Mutex<HashMap<PathBuf, Arc<MetaStore>>> = Mutex::new(HashMap::new());
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("skipping corrupt cache record - {}", err);
            None
        }
    }
}

/// One reconciled listing, applied in a single transaction by
/// [MetaStore::apply_listing].
#[derive(Debug)]
pub struct ListingUpdate {
    pub dir: CachedDirectory,
    pub remove_dirs: Vec<String>,
    pub remove_objects: Vec<String>,
    pub add_dirs: Vec<CachedDirectory>,
    pub add_objects: Vec<CachedObject>,
}

pub struct MetaStore {
    name: String,
    db_path: PathBuf,
    db: Database,
    chunks: ChunkStore,
    clean_mutex: Mutex<()>,
}

impl MetaStore {
    /// Open (or create) the store at `db_path` with chunk files rooted at
    /// `chunk_root`.
    ///
    /// `wait` bounds how long we retry while another instance holds the
    /// file, zero meaning wait forever. Re-opening a path already open in
    /// this process returns the existing instance.
    pub fn open<P: Into<PathBuf>, Q: Into<PathBuf>>(
        name: &str,
        db_path: P,
        chunk_root: Q,
        wait: Duration,
    ) -> Result<Arc<Self>, Error> {
        let db_path: PathBuf = db_path.into();

        let mut map = STORE_MAP.lock().unwrap();
        if let Some(store) = map.get(&db_path) {
            return Ok(Arc::clone(store));
        }

        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let start = Instant::now();
        let db = loop {
            match Database::create(&db_path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    if !wait.is_zero() && start.elapsed() >= wait {
                        return Err(StoreBusy(db_path).into());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    bail!("unable to open metadata store {:?} - {}", db_path, err)
                }
            }
        };

        // make sure all tables exist before the first reader shows up
        let txn = db.begin_write()?;
        txn.open_table(DIRS)?;
        txn.open_table(OBJECTS)?;
        txn.open_table(CHUNK_TS)?;
        txn.open_table(PENDING)?;
        txn.commit()?;

        let chunks = ChunkStore::open(name, chunk_root)?;

        let store = Arc::new(Self {
            name: name.to_owned(),
            db_path: db_path.clone(),
            db,
            chunks,
            clean_mutex: Mutex::new(()),
        });
        map.insert(db_path, Arc::clone(&store));
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    // directory records

    pub fn get_dir(&self, path: &str) -> Result<Option<CachedDirectory>, Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DIRS)?;
        Ok(table
            .get(path.as_str())?
            .and_then(|guard| decode(guard.value())))
    }

    pub fn add_dir(&self, dir: &CachedDirectory) -> Result<(), Error> {
        self.add_batch_dirs(std::slice::from_ref(dir))
    }

    /// Insert a batch of directory records in a single transaction, as a
    /// listing reconciliation does.
    pub fn add_batch_dirs(&self, dirs: &[CachedDirectory]) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIRS)?;
            for dir in dirs {
                let data = serde_json::to_vec(dir)?;
                table.insert(dir.path.as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Direct children of `dir` as recorded by the last completed listing.
    pub fn get_dir_entries(
        &self,
        dir: &str,
    ) -> Result<(Vec<CachedDirectory>, Vec<CachedObject>), Error> {
        let dir = types::normalize(dir);
        let txn = self.db.begin_read()?;

        let mut dirs = Vec::new();
        let table = txn.open_table(DIRS)?;
        for item in table.iter()? {
            let (key, value) = item?;
            if !types::is_direct_child(&dir, key.value()) {
                continue;
            }
            if let Some(rec) = decode::<CachedDirectory>(value.value()) {
                dirs.push(rec);
            }
        }

        let mut objects = Vec::new();
        let table = txn.open_table(OBJECTS)?;
        for item in table.iter()? {
            let (key, value) = item?;
            if !types::is_direct_child(&dir, key.value()) {
                continue;
            }
            if let Some(rec) = decode::<CachedObject>(value.value()) {
                objects.push(rec);
            }
        }

        Ok((dirs, objects))
    }

    /// Recursively drop a directory: its record, every record below it,
    /// the matching ledger rows, and the chunk files on disk.
    pub fn remove_dir(&self, path: &str) -> Result<(), Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIRS)?;
            let doomed: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_owned())
                .filter(|key| types::is_within(&path, key))
                .collect();
            for key in doomed {
                table.remove(key.as_str())?;
            }

            let mut table = txn.open_table(OBJECTS)?;
            let doomed: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_owned())
                .filter(|key| types::is_within(&path, key))
                .collect();
            for key in doomed {
                table.remove(key.as_str())?;
            }

            let mut table = txn.open_table(CHUNK_TS)?;
            let doomed: Vec<u64> = table
                .iter()?
                .filter_map(|item| item.ok())
                .filter_map(|(key, value)| {
                    decode::<ChunkRef>(value.value()).map(|entry| (key.value(), entry))
                })
                .filter(|(_, entry)| types::is_within(&path, &entry.path))
                .map(|(key, _)| key)
                .collect();
            for key in doomed {
                table.remove(key)?;
            }
        }
        txn.commit()?;

        self.chunks.remove_dir(&path)?;
        Ok(())
    }

    /// Mark `dir` and every ancestor up to the root expired, in one
    /// transaction, so the next listing re-fetches the whole chain.
    pub fn expire_dir(&self, path: &str) -> Result<(), Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIRS)?;
            let mut cursor: Option<&str> = Some(path.as_str());
            while let Some(dir) = cursor {
                let rec = table
                    .get(dir)?
                    .and_then(|guard| decode::<CachedDirectory>(guard.value()));
                if let Some(mut rec) = rec {
                    rec.cache_ts = 0;
                    let data = serde_json::to_vec(&rec)?;
                    table.insert(dir, data.as_slice())?;
                }
                cursor = types::parent(dir);
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Apply one reconciled listing atomically: the directory's own
    /// record, the removals of entries the source no longer has, and the
    /// fresh child records all land in a single transaction, so a
    /// `get_dir_entries` between two listings never sees a half-updated
    /// bucket.
    pub fn apply_listing(&self, update: &ListingUpdate) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIRS)?;
            let doomed: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_owned())
                .filter(|key| {
                    update
                        .remove_dirs
                        .iter()
                        .any(|dir| types::is_within(dir, key))
                })
                .collect();
            for key in doomed {
                table.remove(key.as_str())?;
            }
            for dir in &update.add_dirs {
                let data = serde_json::to_vec(dir)?;
                table.insert(dir.path.as_str(), data.as_slice())?;
            }
            let data = serde_json::to_vec(&update.dir)?;
            table.insert(update.dir.path.as_str(), data.as_slice())?;

            let mut table = txn.open_table(OBJECTS)?;
            let doomed: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_owned())
                .filter(|key| {
                    update.remove_objects.iter().any(|path| path == key)
                        || update
                            .remove_dirs
                            .iter()
                            .any(|dir| types::is_within(dir, key))
                })
                .collect();
            for key in doomed {
                table.remove(key.as_str())?;
            }
            for object in &update.add_objects {
                let data = serde_json::to_vec(object)?;
                table.insert(object.info.path.as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // object records

    pub fn get_object(&self, path: &str) -> Result<Option<CachedObject>, Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(OBJECTS)?;
        Ok(table
            .get(path.as_str())?
            .and_then(|guard| decode(guard.value())))
    }

    pub fn add_object(&self, object: &CachedObject) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OBJECTS)?;
            let data = serde_json::to_vec(object)?;
            table.insert(object.info.path.as_str(), data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove_object(&self, path: &str) -> Result<(), Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OBJECTS)?;
            table.remove(path.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Mark one object record expired; with `with_data` its chunks and
    /// ledger rows go too.
    pub fn expire_object(&self, path: &str, with_data: bool) -> Result<(), Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(OBJECTS)?;
            let rec = table
                .get(path.as_str())?
                .and_then(|guard| decode::<CachedObject>(guard.value()));
            if let Some(mut rec) = rec {
                rec.cache_ts = 0;
                let data = serde_json::to_vec(&rec)?;
                table.insert(path.as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;

        if with_data {
            self.wipe_chunks(&path)?;
        }
        Ok(())
    }

    pub fn has_entry(&self, path: &str) -> Result<bool, Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_read()?;
        if txn.open_table(DIRS)?.get(path.as_str())?.is_some() {
            return Ok(true);
        }
        Ok(txn.open_table(OBJECTS)?.get(path.as_str())?.is_some())
    }

    // chunk ledger

    /// Ledger timestamp for `(path, offset)`, if any.
    pub fn get_chunk_ts(&self, path: &str, offset: u64) -> Result<Option<i64>, Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNK_TS)?;
        for item in table.iter()? {
            let (key, value) = item?;
            if let Some(entry) = decode::<ChunkRef>(value.value()) {
                if entry.path == path && entry.offset == offset {
                    return Ok(Some(key.value() as i64));
                }
            }
        }
        Ok(None)
    }

    /// Store chunk bytes on disk and record them in the ledger.
    ///
    /// The file and the ledger are updated within the same call. For a
    /// given `(path, offset)` the ledger keeps at most one live row: an
    /// existing row with a strictly newer timestamp suppresses this write,
    /// older rows are replaced.
    pub fn add_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), Error> {
        let path = types::normalize(path);
        self.chunks.add_chunk(&path, offset, data)?;

        let ts = types::next_chunk_ts() as u64;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNK_TS)?;
            let mut stale: Vec<u64> = Vec::new();
            let mut superseded = false;
            for item in table.iter()? {
                let (key, value) = item?;
                let entry = match decode::<ChunkRef>(value.value()) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.path == path && entry.offset == offset {
                    if key.value() > ts {
                        superseded = true;
                    } else {
                        stale.push(key.value());
                    }
                }
            }
            if !superseded {
                for key in stale {
                    table.remove(key)?;
                }
                let entry = ChunkRef {
                    path: path.clone(),
                    offset,
                    size: data.len() as u64,
                };
                let data = serde_json::to_vec(&entry)?;
                table.insert(ts, data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Drop all chunk files and ledger rows of one object.
    pub fn wipe_chunks(&self, path: &str) -> Result<(), Error> {
        let path = types::normalize(path);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNK_TS)?;
            let doomed: Vec<u64> = table
                .iter()?
                .filter_map(|item| item.ok())
                .filter_map(|(key, value)| {
                    decode::<ChunkRef>(value.value()).map(|entry| (key.value(), entry))
                })
                .filter(|(_, entry)| entry.path == path)
                .map(|(key, _)| key)
                .collect();
            for key in doomed {
                table.remove(key)?;
            }
        }
        txn.commit()?;

        self.chunks.remove_object(&path)?;
        Ok(())
    }

    /// Drop chunk files and ledger rows for every object below `dir`.
    pub fn wipe_chunks_within(&self, dir: &str) -> Result<(), Error> {
        let dir = types::normalize(dir);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNK_TS)?;
            let doomed: Vec<u64> = table
                .iter()?
                .filter_map(|item| item.ok())
                .filter_map(|(key, value)| {
                    decode::<ChunkRef>(value.value()).map(|entry| (key.value(), entry))
                })
                .filter(|(_, entry)| types::is_within(&dir, &entry.path))
                .map(|(key, _)| key)
                .collect();
            for key in doomed {
                table.remove(key)?;
            }
        }
        txn.commit()?;

        self.chunks.remove_dir(&dir)?;
        Ok(())
    }

    /// Evict oldest chunks until the ledger total fits `max` bytes.
    ///
    /// Chunk files are deleted before their ledger rows; a failure on
    /// either side leaves work for the next run, the walk is idempotent.
    pub fn clean_chunks_by_size(&self, max: u64) -> Result<u64, Error> {
        let _guard = self.clean_mutex.lock().unwrap();

        let mut entries: Vec<(u64, ChunkRef)> = Vec::new();
        {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(CHUNK_TS)?;
            for item in table.iter()? {
                let (key, value) = item?;
                if let Some(entry) = decode::<ChunkRef>(value.value()) {
                    entries.push((key.value(), entry));
                }
            }
        }

        let total: u64 = entries.iter().map(|(_, e)| e.size).sum();
        if total <= max {
            return Ok(0);
        }

        let mut removed = 0u64;
        let mut doomed: Vec<u64> = Vec::new();
        for (ts, entry) in &entries {
            if total - removed <= max {
                break;
            }
            if let Err(err) = self.chunks.remove_chunk(&entry.path, entry.offset) {
                log::warn!("cache '{}': chunk cleanup failed - {}", self.name, err);
            }
            doomed.push(*ts);
            removed += entry.size;
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNK_TS)?;
            for key in &doomed {
                table.remove(*key)?;
            }
        }
        txn.commit()?;

        log::debug!(
            "cache '{}': evicted {} chunks ({} bytes)",
            self.name,
            doomed.len(),
            removed
        );
        Ok(removed)
    }

    // pending upload queue

    pub fn add_pending(&self, dest: &str) -> Result<(), Error> {
        let entry = PendingUpload::new(dest);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PENDING)?;
            let data = serde_json::to_vec(&entry)?;
            table.insert(entry.dest.as_str(), data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_pending(&self, dest: &str) -> Result<Option<PendingUpload>, Error> {
        let dest = types::normalize(dest);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PENDING)?;
        Ok(table
            .get(dest.as_str())?
            .and_then(|guard| decode(guard.value())))
    }

    pub fn remove_pending(&self, dest: &str) -> Result<(), Error> {
        let dest = types::normalize(dest);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PENDING)?;
            table.remove(dest.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Roll the `started` flag back after a failed upload attempt.
    pub fn reset_pending(&self, dest: &str) -> Result<(), Error> {
        let dest = types::normalize(dest);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PENDING)?;
            let rec = table
                .get(dest.as_str())?
                .and_then(|guard| decode::<PendingUpload>(guard.value()));
            if let Some(mut rec) = rec {
                rec.started = false;
                let data = serde_json::to_vec(&rec)?;
                table.insert(dest.as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Re-point a not-yet-started pending upload at a new destination,
    /// refreshing its queue time.
    pub fn rename_pending(&self, old: &str, new: &str) -> Result<(), Error> {
        let old = types::normalize(old);
        let entry = PendingUpload::new(new);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PENDING)?;
            if table.remove(old.as_str())?.is_none() {
                bail!("no pending upload for '{}'", old);
            }
            let data = serde_json::to_vec(&entry)?;
            table.insert(entry.dest.as_str(), data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Pending uploads whose destination sits directly in `dir`.
    pub fn pending_in_dir(&self, dir: &str) -> Result<Vec<PendingUpload>, Error> {
        let dir = types::normalize(dir);
        self.scan_pending(|entry| types::is_direct_child(&dir, &entry.dest))
    }

    /// Pending uploads anywhere below `dir`.
    pub fn pending_within(&self, dir: &str) -> Result<Vec<PendingUpload>, Error> {
        let dir = types::normalize(dir);
        self.scan_pending(|entry| types::is_within(&dir, &entry.dest))
    }

    fn scan_pending<F: Fn(&PendingUpload) -> bool>(
        &self,
        keep: F,
    ) -> Result<Vec<PendingUpload>, Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PENDING)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            if let Some(entry) = decode::<PendingUpload>(value.value()) {
                if keep(&entry) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    /// Claim the next pending upload that has waited at least `wait` and
    /// has not been started. The `started` flag flips inside the same
    /// transaction, so two uploader ticks can never claim the same entry.
    pub fn next_pending(&self, wait: Duration) -> Result<Option<PendingUpload>, Error> {
        let now = types::unix_nanos();
        let txn = self.db.begin_write()?;
        let claimed = {
            let mut table = txn.open_table(PENDING)?;
            let mut due: Option<PendingUpload> = None;
            for item in table.iter()? {
                let (_, value) = item?;
                let entry = match decode::<PendingUpload>(value.value()) {
                    Some(entry) => entry,
                    None => continue,
                };
                if entry.started {
                    continue;
                }
                if entry.added_at.saturating_add(wait.as_nanos() as i64) > now {
                    continue;
                }
                due = Some(entry);
                break;
            }
            if let Some(mut entry) = due {
                entry.started = true;
                let data = serde_json::to_vec(&entry)?;
                table.insert(entry.dest.as_str(), data.as_slice())?;
                Some(entry)
            } else {
                None
            }
        };
        txn.commit()?;
        Ok(claimed)
    }

    /// Rebuild the pending queue from what is physically present in the
    /// staging tree. Runs at startup so a crash mid-upload retries instead
    /// of losing data.
    pub fn reconcile_pending(&self, staging_root: &Path) -> Result<usize, Error> {
        let txn = self.db.begin_write()?;
        let mut count = 0;
        {
            let mut table = txn.open_table(PENDING)?;
            let stale: Vec<String> = table
                .iter()?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_owned())
                .collect();
            for key in stale {
                table.remove(key.as_str())?;
            }

            for entry in walkdir::WalkDir::new(staging_root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let rel = entry
                    .path()
                    .strip_prefix(staging_root)
                    .map_err(|err| format_err!("staging walk escaped root - {}", err))?;
                let dest = types::normalize(&rel.to_string_lossy());
                if dest.is_empty() {
                    continue;
                }
                let rec = PendingUpload::new(&dest);
                let data = serde_json::to_vec(&rec)?;
                table.insert(rec.dest.as_str(), data.as_slice())?;
                count += 1;
            }
        }
        txn.commit()?;
        Ok(count)
    }

    // maintenance

    /// Drop every record and all chunk data.
    pub fn purge(&self) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        let _ = txn.delete_table(DIRS)?;
        let _ = txn.delete_table(OBJECTS)?;
        let _ = txn.delete_table(CHUNK_TS)?;
        let _ = txn.delete_table(PENDING)?;
        // recreate so readers never observe missing tables
        txn.open_table(DIRS)?;
        txn.open_table(OBJECTS)?;
        txn.open_table(CHUNK_TS)?;
        txn.open_table(PENDING)?;
        txn.commit()?;

        self.chunks.purge()?;
        Ok(())
    }

    /// Drop all directory and object records, keeping chunk data and the
    /// pending queue.
    pub fn flush_dir_cache(&self) -> Result<(), Error> {
        let txn = self.db.begin_write()?;
        let _ = txn.delete_table(DIRS)?;
        let _ = txn.delete_table(OBJECTS)?;
        txn.open_table(DIRS)?;
        txn.open_table(OBJECTS)?;
        txn.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, Error> {
        let txn = self.db.begin_read()?;

        let mut chunks = ChunkStats::default();
        let table = txn.open_table(CHUNK_TS)?;
        for item in table.iter()? {
            let (key, value) = item?;
            let entry = match decode::<ChunkRef>(value.value()) {
                Some(entry) => entry,
                None => continue,
            };
            let ts = key.value() as i64;
            chunks.oldest_ts = Some(chunks.oldest_ts.map_or(ts, |old| old.min(ts)));
            chunks.newest_ts = Some(chunks.newest_ts.map_or(ts, |new| new.max(ts)));
            chunks.total_chunks += 1;
            chunks.total_size += entry.size;
        }

        let mut files = FileStats::default();
        let mut fold = |ts: i64| {
            files.oldest_ts = Some(files.oldest_ts.map_or(ts, |old| old.min(ts)));
            files.newest_ts = Some(files.newest_ts.map_or(ts, |new| new.max(ts)));
        };
        let table = txn.open_table(DIRS)?;
        for item in table.iter()? {
            let (_, value) = item?;
            if let Some(rec) = decode::<CachedDirectory>(value.value()) {
                fold(rec.cache_ts);
                files.total_dir += 1;
            }
        }
        let table = txn.open_table(OBJECTS)?;
        for item in table.iter()? {
            let (_, value) = item?;
            if let Some(rec) = decode::<CachedObject>(value.value()) {
                fold(rec.cache_ts);
                files.total_files += 1;
            }
        }

        Ok(CacheStats { chunks, files })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::ObjectInfo;

    fn open_store(dir: &tempfile::TempDir, name: &str) -> Arc<MetaStore> {
        MetaStore::open(
            name,
            dir.path().join(format!("{}.db", name)),
            dir.path().join(name),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_reopen_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_store(&dir, "same");
        let b = open_store(&dir, "same");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dir_and_object_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "records");

        store.add_dir(&CachedDirectory::new("a", 1)).unwrap();
        store
            .add_batch_dirs(&[CachedDirectory::new("a/b", 2), CachedDirectory::new("a/c", 3)])
            .unwrap();
        store
            .add_object(&CachedObject::new(ObjectInfo::new("a/x.bin", 10, 4)))
            .unwrap();
        store
            .add_object(&CachedObject::new(ObjectInfo::new("a/b/y.bin", 20, 5)))
            .unwrap();

        assert!(store.get_dir("a").unwrap().is_some());
        assert!(store.has_entry("a/b").unwrap());
        assert!(store.has_entry("a/x.bin").unwrap());
        assert!(!store.has_entry("missing").unwrap());

        let (dirs, objects) = store.get_dir_entries("a").unwrap();
        let mut dir_names: Vec<_> = dirs.iter().map(|d| d.path.as_str()).collect();
        dir_names.sort_unstable();
        assert_eq!(dir_names, ["a/b", "a/c"]);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].info.path, "a/x.bin");

        store.remove_dir("a/b").unwrap();
        assert!(!store.has_entry("a/b").unwrap());
        assert!(!store.has_entry("a/b/y.bin").unwrap());
        assert!(store.has_entry("a/x.bin").unwrap());
    }

    #[test]
    fn test_expire_dir_walks_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "expire");

        store
            .add_batch_dirs(&[
                CachedDirectory::new("", 0),
                CachedDirectory::new("a", 0),
                CachedDirectory::new("a/b", 0),
                CachedDirectory::new("a/b/c", 0),
                CachedDirectory::new("other", 0),
            ])
            .unwrap();

        store.expire_dir("a/b/c").unwrap();

        for path in ["", "a", "a/b", "a/b/c"] {
            assert_eq!(store.get_dir(path).unwrap().unwrap().cache_ts, 0, "{path}");
        }
        assert_ne!(store.get_dir("other").unwrap().unwrap().cache_ts, 0);
    }

    #[test]
    fn test_chunk_ledger_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "ledger");

        store.add_chunk("f.bin", 0, b"old!").unwrap();
        let first_ts = store.get_chunk_ts("f.bin", 0).unwrap().unwrap();

        store.add_chunk("f.bin", 0, b"newer").unwrap();
        let second_ts = store.get_chunk_ts("f.bin", 0).unwrap().unwrap();
        assert!(second_ts > first_ts);

        // still exactly one ledger row for the pair
        let stats = store.stats().unwrap();
        assert_eq!(stats.chunks.total_chunks, 1);
        assert_eq!(stats.chunks.total_size, 5);
        assert_eq!(
            store.chunk_store().get_chunk("f.bin", 0).unwrap().as_ref(),
            b"newer"
        );
    }

    #[test]
    fn test_clean_chunks_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "clean");

        for i in 0..10u64 {
            store.add_chunk("big.bin", i * 4, b"1234").unwrap();
        }
        assert_eq!(store.stats().unwrap().chunks.total_size, 40);

        let removed = store.clean_chunks_by_size(8).unwrap();
        assert_eq!(removed, 32);

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunks.total_size, 8);
        assert_eq!(stats.chunks.total_chunks, 2);

        // the two survivors are the two newest offsets
        assert!(store.chunk_store().has_chunk("big.bin", 32));
        assert!(store.chunk_store().has_chunk("big.bin", 36));
        assert!(!store.chunk_store().has_chunk("big.bin", 0));

        // already under the bound: no-op
        assert_eq!(store.clean_chunks_by_size(8).unwrap(), 0);
    }

    #[test]
    fn test_pending_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "pending");

        store.add_pending("a/one").unwrap();
        store.add_pending("a/two").unwrap();

        // not due yet
        assert!(store.next_pending(Duration::from_secs(3600)).unwrap().is_none());

        let first = store.next_pending(Duration::ZERO).unwrap().unwrap();
        assert!(first.started);
        // the claimed entry is skipped on the next tick
        let second = store.next_pending(Duration::ZERO).unwrap().unwrap();
        assert_ne!(first.dest, second.dest);
        assert!(store.next_pending(Duration::ZERO).unwrap().is_none());

        // rollback makes it claimable again
        store.reset_pending(&first.dest).unwrap();
        let again = store.next_pending(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.dest, first.dest);

        store.remove_pending(&first.dest).unwrap();
        store.remove_pending(&second.dest).unwrap();
        assert!(store.next_pending(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_rename_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "rename");

        store.add_pending("x/one").unwrap();
        store.rename_pending("x/one", "y/one").unwrap();

        assert!(store.get_pending("x/one").unwrap().is_none());
        let moved = store.get_pending("y/one").unwrap().unwrap();
        assert!(!moved.started);

        assert!(store.rename_pending("x/one", "z/one").is_err());

        let in_y = store.pending_in_dir("y").unwrap();
        assert_eq!(in_y.len(), 1);
        assert!(store.pending_within("y").unwrap().len() == 1);
        assert!(store.pending_in_dir("x").unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "reconcile");
        let staging = dir.path().join("staging");

        std::fs::create_dir_all(staging.join("a")).unwrap();
        std::fs::write(staging.join("a/one.bin"), b"1").unwrap();
        std::fs::write(staging.join("two.bin"), b"2").unwrap();

        store.add_pending("ghost").unwrap();
        let count = store.reconcile_pending(&staging).unwrap();
        assert_eq!(count, 2);

        assert!(store.get_pending("ghost").unwrap().is_none());
        assert!(store.get_pending("a/one.bin").unwrap().is_some());
        assert!(store.get_pending("two.bin").unwrap().is_some());
    }

    #[test]
    fn test_purge_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "purge");

        store.add_dir(&CachedDirectory::new("d", 0)).unwrap();
        store
            .add_object(&CachedObject::new(ObjectInfo::new("d/o", 1, 0)))
            .unwrap();
        store.add_chunk("d/o", 0, b"x").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.files.total_dir, 1);
        assert_eq!(stats.files.total_files, 1);
        assert_eq!(stats.chunks.total_chunks, 1);
        assert!(stats.chunks.oldest_ts.is_some());

        store.purge().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats, CacheStats::default());
        assert!(!store.chunk_store().has_chunk("d/o", 0));
    }
}
