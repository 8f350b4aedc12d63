//! The cache facade: a [RemoteFs]-shaped layer over a wrapped source.
//!
//! Metadata reads go through the TTL'd records in the metadata store,
//! object reads through [ObjectHandle] and the two chunk tiers, and every
//! mutating operation performs its cache-coherent side effects here:
//! dropping stale records and chunks, expiring the affected directory
//! chain, and broadcasting a change to subscribers.

use std::sync::{Arc, Mutex, Weak};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use blobcache_store::meta_store::ListingUpdate;
use blobcache_store::types::{self, CachedDirectory, CachedObject, ObjectInfo};
use blobcache_store::{MemCache, MetaStore, StoreBusy};

use crate::config::CacheConfig;
use crate::error::FsError;
use crate::handle::{ObjectHandle, ReaderHint};
use crate::janitor;
use crate::limiter::OpenGate;
use crate::notify::{ChangeCallback, Notifier};
use crate::remote::{
    AboutInfo, ChangeEvent, DataStream, DirInfo, Entry, EntryKind, Features, LocalFs, RemoteFs,
};
use crate::uploader::{self, UploadEvent, UploaderControl};

pub(crate) struct CacheInner {
    pub(crate) name: String,
    pub(crate) config: CacheConfig,
    pub(crate) source: Arc<dyn RemoteFs>,
    pub(crate) staging: Option<Arc<LocalFs>>,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) memory: Option<Arc<MemCache>>,
    pub(crate) gate: Arc<OpenGate>,
    pub(crate) notifier: Notifier,
    pub(crate) features: Features,
    hint: Option<Arc<dyn ReaderHint>>,
    wrapper: Mutex<Option<Weak<dyn RemoteFs>>>,
    upload_control: Option<mpsc::Sender<UploaderControl>>,
    upload_events: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
    upload_task: Mutex<Option<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheInner {
    /// Translate one out-of-band source change: expire the object with its
    /// data, expire the parent chain, fan out to subscribers.
    pub(crate) fn handle_source_change(&self, event: &ChangeEvent) {
        if !self.notifier.mark_notified(&event.path) {
            // already handled since the last janitor tick
            return;
        }
        match event.kind {
            EntryKind::Object => {
                if let Some(memory) = &self.memory {
                    memory.remove_object(&event.path);
                }
                if let Err(err) = self.meta.expire_object(&event.path, true) {
                    log::warn!("expiring '{}' failed - {}", event.path, err);
                }
                if let Some(parent) = types::parent(&event.path) {
                    if let Err(err) = self.meta.expire_dir(parent) {
                        log::warn!("expiring '{}' failed - {}", parent, err);
                    }
                }
            }
            EntryKind::Dir => {
                if let Err(err) = self.meta.expire_dir(&event.path) {
                    log::warn!("expiring '{}' failed - {}", event.path, err);
                }
            }
        }
        self.notifier.broadcast(&event.path, event.kind);
    }

    fn expire_parent_and_broadcast(&self, path: &str, kind: EntryKind) -> Result<(), FsError> {
        if let Some(parent) = types::parent(path) {
            self.meta.expire_dir(parent)?;
            self.notifier.broadcast(parent, EntryKind::Dir);
        }
        self.notifier.broadcast(path, kind);
        Ok(())
    }
}

/// The cache FS. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct CacheFs {
    inner: Arc<CacheInner>,
}

fn now_secs() -> i64 {
    types::unix_nanos() / 1_000_000_000
}

impl CacheFs {
    pub fn new(
        name: &str,
        source: Arc<dyn RemoteFs>,
        config: CacheConfig,
    ) -> Result<Self, FsError> {
        Self::new_with_hint(name, source, config, None)
    }

    /// Like [CacheFs::new] with an external-reader hint wired in; handles
    /// consult it to scale their worker pools.
    pub fn new_with_hint(
        name: &str,
        source: Arc<dyn RemoteFs>,
        config: CacheConfig,
        hint: Option<Arc<dyn ReaderHint>>,
    ) -> Result<Self, FsError> {
        config.validate()?;

        let db_path = config.cache_dir.join(format!("{}.db", name));
        let chunk_root = config.cache_dir.join(name);
        let meta = MetaStore::open(name, db_path, chunk_root, config.db_wait_time).map_err(
            |err| {
                if err.is::<StoreBusy>() {
                    FsError::StoreBusy
                } else {
                    FsError::Other(err)
                }
            },
        )?;
        if config.db_purge {
            meta.purge()?;
        }

        let staging = match &config.temp_upload_path {
            Some(path) => Some(Arc::new(LocalFs::new(&format!("{}-staging", name), path)?)),
            None => None,
        };
        if let Some(staging) = &staging {
            let queued = meta.reconcile_pending(staging.root())?;
            if queued > 0 {
                log::info!("cache '{}': {} staged uploads queued for retry", name, queued);
            }
        }

        let memory = if config.use_memory {
            Some(Arc::new(MemCache::new()))
        } else {
            None
        };
        let gate = Arc::new(OpenGate::new(config.rps, config.workers));

        // probe the source's optional capabilities once; with staging
        // enabled the staging FS has to support an operation as well
        let src = source.features();
        let stg = staging.as_ref().map(|s| s.features());
        let features = Features {
            list_r: src.list_r,
            can_move: src.can_move && stg.map_or(true, |f| f.can_move),
            can_copy: src.can_copy && stg.map_or(true, |f| f.can_copy),
            can_dir_move: src.can_dir_move && stg.map_or(true, |f| f.can_dir_move),
            can_purge: src.can_purge,
            about: src.about,
            // outward change notifications are always available, the cache
            // synthesizes them when the source cannot deliver any
            change_notify: true,
            put_stream: src.put_stream,
        };

        let mut upload_control = None;
        let mut upload_control_rx = None;
        let mut upload_events_tx = None;
        let mut upload_events_rx = None;
        if staging.is_some() {
            let (control_tx, control_rx) = mpsc::channel(8);
            let (events_tx, events_rx) = mpsc::channel(64);
            upload_control = Some(control_tx);
            upload_control_rx = Some(control_rx);
            upload_events_tx = Some(events_tx);
            upload_events_rx = Some(events_rx);
        }

        let inner = Arc::new(CacheInner {
            name: name.to_owned(),
            config,
            source,
            staging,
            meta,
            memory,
            gate,
            notifier: Notifier::new(),
            features,
            hint,
            wrapper: Mutex::new(None),
            upload_control,
            upload_events: Mutex::new(upload_events_rx),
            upload_task: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![janitor::start(
            Arc::downgrade(&inner),
            inner.config.chunk_clean_interval,
        )];
        if let Some(mut changes) = inner
            .source
            .subscribe_changes(inner.config.chunk_clean_interval)
        {
            let weak = Arc::downgrade(&inner);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = changes.recv().await {
                    let Some(fs) = weak.upgrade() else { break };
                    fs.handle_source_change(&event);
                }
            }));
        }
        *inner.background_tasks.lock().unwrap() = tasks;

        if let (Some(control_rx), Some(events_tx), Some(control_tx)) = (
            upload_control_rx,
            upload_events_tx,
            inner.upload_control.clone(),
        ) {
            uploader::register(name, control_tx);
            let task = uploader::start(Arc::downgrade(&inner), control_rx, events_tx);
            *inner.upload_task.lock().unwrap() = Some(task);
        }

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn features(&self) -> Features {
        self.inner.features
    }

    /// The wrapped source FS.
    pub fn unwrap_source(&self) -> Arc<dyn RemoteFs> {
        Arc::clone(&self.inner.source)
    }

    /// Register an outer wrapper (e.g. a name encoder sitting above the
    /// cache). Held weakly, the wrapper owns the cache and not vice versa.
    pub fn set_wrapper(&self, wrapper: &Arc<dyn RemoteFs>) {
        *self.inner.wrapper.lock().unwrap() = Some(Arc::downgrade(wrapper));
    }

    pub fn wrapper(&self) -> Option<Arc<dyn RemoteFs>> {
        self.inner
            .wrapper
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Register a change-notification subscriber. Callbacks run on the
    /// broadcasting task and must not block.
    pub fn subscribe(&self, callback: ChangeCallback) {
        self.inner.notifier.subscribe(callback);
    }

    /// The background-upload observer channel. The receiver can be taken
    /// exactly once.
    pub fn take_upload_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.inner.upload_events.lock().unwrap().take()
    }

    pub fn pause_uploads(&self) -> bool {
        self.control_uploads(UploaderControl::Pause)
    }

    pub fn resume_uploads(&self) -> bool {
        self.control_uploads(UploaderControl::Run)
    }

    fn control_uploads(&self, msg: UploaderControl) -> bool {
        match &self.inner.upload_control {
            Some(control) => control.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Object lookup: fresh cache record, else staging (staged data wins
    /// over the source), else source. A lookup that misses everywhere
    /// drops any stale record before propagating NotFound.
    pub async fn new_object(&self, remote: &str) -> Result<CachedObject, FsError> {
        let path = types::normalize(remote);
        let inner = &self.inner;

        if let Some(record) = inner.meta.get_object(&path)? {
            if record.is_fresh(inner.config.info_age) {
                return Ok(record);
            }
        }

        if let Some(staging) = &inner.staging {
            match staging.new_object(&path).await {
                Ok(info) => {
                    let record = CachedObject::new(info);
                    inner.meta.add_object(&record)?;
                    return Ok(record);
                }
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        match inner.source.new_object(&path).await {
            Ok(info) => {
                let record = CachedObject::new(info);
                inner.meta.add_object(&record)?;
                Ok(record)
            }
            Err(FsError::NotFound) => {
                inner.meta.remove_object(&path)?;
                Err(FsError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Cached listing within TTL, else a full reconciliation against the
    /// source: entries the source no longer has are dropped, fresh entries
    /// stored, staged files win over their source-side counterparts, and
    /// the whole update lands in one metadata transaction.
    pub async fn list(&self, dir: &str) -> Result<Vec<Entry>, FsError> {
        let dir = types::normalize(dir);
        let inner = &self.inner;

        let cached_dir = inner.meta.get_dir(&dir)?;
        if let Some(record) = &cached_dir {
            if record.is_fresh(inner.config.info_age) {
                let (dirs, objects) = inner.meta.get_dir_entries(&dir)?;
                if !dirs.is_empty() || !objects.is_empty() {
                    let mut entries: Vec<Entry> = dirs
                        .into_iter()
                        .map(|d| {
                            Entry::Dir(DirInfo {
                                path: d.path,
                                mod_time: d.mod_time,
                                child_count: d.child_count,
                            })
                        })
                        .chain(objects.into_iter().map(|o| Entry::Object(o.info)))
                        .collect();
                    entries.sort_by(|a, b| a.path().cmp(b.path()));
                    return Ok(entries);
                }
            }
        }

        // staged files for this directory, materialized as objects
        let mut staged: Vec<ObjectInfo> = Vec::new();
        if let Some(staging) = &inner.staging {
            for pending in inner.meta.pending_in_dir(&dir)? {
                match staging.new_object(&pending.dest).await {
                    Ok(info) => staged.push(info),
                    Err(FsError::NotFound) => {} // claimed by the uploader meanwhile
                    Err(err) => return Err(err),
                }
            }
        }

        let mut source_entries = match inner.source.list(&dir).await {
            Ok(entries) => entries,
            // a directory that only exists in staging yet
            Err(FsError::NotFound) if !staged.is_empty() => Vec::new(),
            Err(err) => return Err(err),
        };
        source_entries.sort_by(|a, b| a.path().cmp(b.path()));
        staged.sort_by(|a, b| a.path.cmp(&b.path));

        let (cached_dirs, cached_objects) = inner.meta.get_dir_entries(&dir)?;

        let mut update = ListingUpdate {
            dir: CachedDirectory::new(&dir, cached_dir.map_or(0, |d| d.mod_time)),
            remove_dirs: Vec::new(),
            remove_objects: Vec::new(),
            add_dirs: Vec::new(),
            add_objects: Vec::new(),
        };

        // reconcile: cached entries the source no longer has go away
        for cached in &cached_dirs {
            if !source_entries
                .iter()
                .any(|e| matches!(e, Entry::Dir(d) if d.path == cached.path))
            {
                update.remove_dirs.push(cached.path.clone());
            }
        }
        for cached in &cached_objects {
            let in_source = source_entries
                .iter()
                .any(|e| matches!(e, Entry::Object(o) if o.path == cached.info.path));
            let is_staged = staged.iter().any(|s| s.path == cached.info.path);
            if !in_source && !is_staged {
                update.remove_objects.push(cached.info.path.clone());
            }
        }

        let mut entries: Vec<Entry> = staged.iter().cloned().map(Entry::Object).collect();
        for entry in source_entries {
            match entry {
                Entry::Object(info) => {
                    if staged.iter().any(|s| s.path == info.path) {
                        continue; // staged wins over the source copy
                    }
                    update.add_objects.push(CachedObject::new(info.clone()));
                    entries.push(Entry::Object(info));
                }
                Entry::Dir(info) => {
                    update.add_dirs.push(CachedDirectory::new(&info.path, info.mod_time));
                    entries.push(Entry::Dir(info));
                }
            }
        }

        inner.meta.apply_listing(&update)?;

        entries.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(entries)
    }

    /// Recursive listing: stream the source's recursive walk through the
    /// cache-insert path where supported, explicit DFS over [CacheFs::list]
    /// otherwise.
    pub async fn list_recursive(&self, dir: &str) -> Result<Vec<Entry>, FsError> {
        let dir = types::normalize(dir);
        let inner = &self.inner;

        if !inner.features.list_r {
            let mut entries = Vec::new();
            let mut stack = vec![dir];
            while let Some(current) = stack.pop() {
                for entry in self.list(&current).await? {
                    if let Entry::Dir(info) = &entry {
                        stack.push(info.path.clone());
                    }
                    entries.push(entry);
                }
            }
            return Ok(entries);
        }

        let entries = inner.source.list_recursive(&dir).await?;
        let mut dirs = Vec::new();
        for entry in &entries {
            match entry {
                Entry::Object(info) => {
                    inner.meta.add_object(&CachedObject::new(info.clone()))?;
                }
                Entry::Dir(info) => dirs.push(CachedDirectory::new(&info.path, info.mod_time)),
            }
        }
        inner.meta.add_batch_dirs(&dirs)?;
        Ok(entries)
    }

    pub(crate) fn inner(&self) -> &CacheInner {
        &self.inner
    }

    /// Where reads of `path` come from: the staging tree while an upload
    /// is still pending, the source otherwise.
    pub(crate) fn read_source_for(&self, path: &str) -> Result<Arc<dyn RemoteFs>, FsError> {
        match &self.inner.staging {
            Some(staging) if self.inner.meta.get_pending(path)?.is_some() => {
                Ok(Arc::clone(staging) as Arc<dyn RemoteFs>)
            }
            _ => Ok(Arc::clone(&self.inner.source)),
        }
    }

    /// Open an object for chunked reading. A still-staged file is read
    /// from the staging tree instead of the source.
    pub async fn open(&self, remote: &str) -> Result<ObjectHandle, FsError> {
        let object = self.new_object(remote).await?;
        let inner = &self.inner;

        let read_source = self.read_source_for(&object.info.path)?;

        Ok(ObjectHandle::open(
            object.info,
            read_source,
            Arc::clone(&inner.meta),
            inner.memory.clone(),
            Arc::clone(&inner.gate),
            inner.config.chunk_size,
            inner.config.workers,
            inner.config.read_retries,
            inner.hint.clone(),
        ))
    }

    /// Store an object. With staging enabled the bytes land in the staging
    /// tree and a pending upload is queued; with `store_writes` the stream
    /// is teed into the chunk store while uploading; otherwise it passes
    /// straight through. Any previously cached object at the path is
    /// dropped before the fresh record is persisted.
    pub async fn put(
        &self,
        remote: &str,
        data: DataStream,
        mod_time: i64,
    ) -> Result<CachedObject, FsError> {
        let path = types::normalize(remote);
        if path.is_empty() {
            return Err(FsError::IsDir);
        }
        let inner = &self.inner;

        if let Some(memory) = &inner.memory {
            memory.remove_object(&path);
        }
        inner.meta.wipe_chunks(&path)?;
        inner.meta.remove_object(&path)?;

        let info = if let Some(staging) = &inner.staging {
            let info = staging.put(&path, data, mod_time).await?;
            inner.meta.add_pending(&path)?;
            info
        } else if inner.config.store_writes {
            self.put_with_tee(&path, data, mod_time).await?
        } else {
            inner.source.put(&path, data, mod_time).await?
        };

        let record = CachedObject::new(info);
        inner.meta.add_object(&record)?;
        inner.expire_parent_and_broadcast(&path, EntryKind::Object)?;
        Ok(record)
    }

    /// Write-through put: upload to the source while storing the same
    /// bytes as chunks. The source's returned object is authoritative; if
    /// it reports a different size the teed chunks are dropped again.
    async fn put_with_tee(
        &self,
        path: &str,
        mut data: DataStream,
        mod_time: i64,
    ) -> Result<ObjectInfo, FsError> {
        use tokio::io::AsyncWriteExt;

        let inner = &self.inner;
        let chunk_size = inner.config.chunk_size as usize;

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let source = Arc::clone(&inner.source);
        let dest = path.to_owned();
        let upload =
            tokio::spawn(async move { source.put(&dest, Box::new(reader), mod_time).await });

        let mut chunk: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut offset: u64 = 0;
        let mut teed: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let count = data.read(&mut buf).await?;
            if count == 0 {
                break;
            }
            if writer.write_all(&buf[..count]).await.is_err() {
                // the upload side hung up; surface its error
                drop(writer);
                return match upload.await {
                    Ok(Err(err)) => Err(err),
                    Ok(Ok(_)) => Err(FsError::Other(anyhow::anyhow!(
                        "source closed the upload stream early"
                    ))),
                    Err(err) => Err(FsError::Other(err.into())),
                };
            }
            teed += count as u64;

            let mut rest = &buf[..count];
            while !rest.is_empty() {
                let room = chunk_size - chunk.len();
                let take = room.min(rest.len());
                chunk.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if chunk.len() == chunk_size {
                    if let Err(err) = inner.meta.add_chunk(path, offset, &chunk) {
                        log::warn!("teeing chunk at {} of '{}' failed - {}", offset, path, err);
                    }
                    offset += chunk_size as u64;
                    chunk.clear();
                }
            }
        }
        if !chunk.is_empty() {
            if let Err(err) = inner.meta.add_chunk(path, offset, &chunk) {
                log::warn!("teeing chunk at {} of '{}' failed - {}", offset, path, err);
            }
        }

        writer.shutdown().await.map_err(|err| FsError::Other(err.into()))?;
        drop(writer);

        let info = upload
            .await
            .map_err(|err| FsError::Other(err.into()))??;
        if info.size != teed {
            log::debug!(
                "'{}': source reports {} bytes, teed {}; dropping teed chunks",
                path,
                info.size,
                teed
            );
            inner.meta.wipe_chunks(path)?;
        }
        Ok(info)
    }

    /// Remove one object from the source (or the staging tree, for a
    /// not-yet-uploaded file) and from the cache.
    pub async fn remove(&self, remote: &str) -> Result<(), FsError> {
        let path = types::normalize(remote);
        let inner = &self.inner;

        let mut removed_staged = false;
        if let Some(staging) = &inner.staging {
            if let Some(pending) = inner.meta.get_pending(&path)? {
                if pending.started {
                    return Err(FsError::Other(anyhow::anyhow!(
                        "can't delete '{}' - upload already started",
                        path
                    )));
                }
                staging.delete(&path).await?;
                inner.meta.remove_pending(&path)?;
                removed_staged = true;
            }
        }
        if !removed_staged {
            inner.source.delete(&path).await?;
        }

        if let Some(memory) = &inner.memory {
            memory.remove_object(&path);
        }
        inner.meta.wipe_chunks(&path)?;
        inner.meta.remove_object(&path)?;
        inner.expire_parent_and_broadcast(&path, EntryKind::Object)?;
        Ok(())
    }

    /// Server-side move with cache coherence. A staged file that has not
    /// started uploading is renamed inside the staging tree and its
    /// pending record re-pointed; no object bytes move. A staged file
    /// mid-upload cannot be moved.
    pub async fn move_object(&self, src: &str, dest: &str) -> Result<CachedObject, FsError> {
        let inner = &self.inner;
        if !inner.features.can_move {
            return Err(FsError::CantMove);
        }
        let src = types::normalize(src);
        let dest = types::normalize(dest);

        // refresh our view of the source object first
        let _ = self.new_object(&src).await?;

        let mut staged = false;
        let info = if let Some(staging) = &inner.staging {
            match inner.meta.get_pending(&src)? {
                Some(pending) if pending.started => return Err(FsError::CantMove),
                Some(_) => {
                    let info = staging.move_object(&src, &dest).await?;
                    inner.meta.rename_pending(&src, &dest)?;
                    staged = true;
                    info
                }
                None => inner.source.move_object(&src, &dest).await?,
            }
        } else {
            inner.source.move_object(&src, &dest).await?
        };
        if staged {
            log::debug!("'{}': moved staged file to '{}', no upload started", src, dest);
        }

        self.finish_transfer(&src, &dest, info, true).await
    }

    /// Server-side copy with cache coherence. A staged, not-yet-started
    /// source file is copied within the staging tree and queued as its own
    /// pending upload.
    pub async fn copy_object(&self, src: &str, dest: &str) -> Result<CachedObject, FsError> {
        let inner = &self.inner;
        if !inner.features.can_copy {
            return Err(FsError::CantCopy);
        }
        let src = types::normalize(src);
        let dest = types::normalize(dest);

        let _ = self.new_object(&src).await?;

        let info = if let Some(staging) = &inner.staging {
            match inner.meta.get_pending(&src)? {
                Some(pending) if pending.started => return Err(FsError::CantCopy),
                Some(_) => {
                    let info = staging.copy_object(&src, &dest).await?;
                    inner.meta.add_pending(&dest)?;
                    info
                }
                None => inner.source.copy_object(&src, &dest).await?,
            }
        } else {
            inner.source.copy_object(&src, &dest).await?
        };

        self.finish_transfer(&src, &dest, info, false).await
    }

    /// Shared tail of move/copy: invalidate the old object, store the new
    /// record, expire both parent chains, broadcast everything.
    async fn finish_transfer(
        &self,
        src: &str,
        dest: &str,
        info: ObjectInfo,
        remove_src: bool,
    ) -> Result<CachedObject, FsError> {
        let inner = &self.inner;

        if let Some(memory) = &inner.memory {
            memory.remove_object(src);
        }
        if remove_src {
            inner.meta.wipe_chunks(src)?;
            inner.meta.remove_object(src)?;
        } else {
            // a copy leaves the source object in place but stale
            inner.meta.expire_object(src, true)?;
        }
        if let Some(memory) = &inner.memory {
            memory.remove_object(dest);
        }
        inner.meta.wipe_chunks(dest)?;

        let record = CachedObject::new(info);
        inner.meta.add_object(&record)?;

        if let Some(parent) = types::parent(src) {
            inner.meta.expire_dir(parent)?;
            inner.notifier.broadcast(parent, EntryKind::Dir);
        }
        inner.notifier.broadcast(src, EntryKind::Object);
        inner.expire_parent_and_broadcast(dest, EntryKind::Object)?;
        Ok(record)
    }

    pub async fn mkdir(&self, dir: &str) -> Result<(), FsError> {
        let dir = types::normalize(dir);
        let inner = &self.inner;

        inner.source.mkdir(&dir).await?;
        inner.meta.add_dir(&CachedDirectory::new(&dir, now_secs()))?;
        inner.expire_parent_and_broadcast(&dir, EntryKind::Dir)?;
        Ok(())
    }

    /// Remove an empty directory. With staging enabled, anything still
    /// pending below the directory counts as content.
    pub async fn rmdir(&self, dir: &str) -> Result<(), FsError> {
        let dir = types::normalize(dir);
        let inner = &self.inner;

        if let Some(staging) = &inner.staging {
            if !inner.meta.pending_within(&dir)?.is_empty() {
                return Err(FsError::DirNotEmpty);
            }
            match staging.list(&dir).await {
                Ok(entries) if !entries.is_empty() => return Err(FsError::DirNotEmpty),
                Ok(_) => {
                    let _ = staging.rmdir(&dir).await;
                }
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        inner.source.rmdir(&dir).await?;
        inner.meta.remove_dir(&dir)?;
        inner.expire_parent_and_broadcast(&dir, EntryKind::Dir)?;
        Ok(())
    }

    /// Server-side directory move. Refused while anything below `src` is
    /// still staged.
    pub async fn dir_move(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let inner = &self.inner;
        if !inner.features.can_dir_move {
            return Err(FsError::CantDirMove);
        }
        let src = types::normalize(src);
        let dest = types::normalize(dest);

        if inner.staging.is_some() && !inner.meta.pending_within(&src)?.is_empty() {
            return Err(FsError::CantDirMove);
        }

        inner.source.dir_move(&src, &dest).await?;
        inner.meta.remove_dir(&src)?;
        if let Some(parent) = types::parent(&src) {
            inner.meta.expire_dir(parent)?;
            inner.notifier.broadcast(parent, EntryKind::Dir);
        }
        inner.notifier.broadcast(&src, EntryKind::Dir);
        inner.expire_parent_and_broadcast(&dest, EntryKind::Dir)?;
        Ok(())
    }

    /// Recursive delete, delegated to the source where supported.
    pub async fn purge(&self, dir: &str) -> Result<(), FsError> {
        let dir = types::normalize(dir);
        let inner = &self.inner;

        if !inner.features.can_purge {
            return Err(FsError::NotSupported);
        }
        inner.source.purge(&dir).await?;

        if dir.is_empty() {
            inner.meta.purge()?;
            if let Some(memory) = &inner.memory {
                memory.clear();
            }
        } else {
            inner.meta.remove_dir(&dir)?;
        }
        inner.expire_parent_and_broadcast(&dir, EntryKind::Dir)?;
        Ok(())
    }

    pub async fn about(&self) -> Result<AboutInfo, FsError> {
        if !self.inner.features.about {
            return Err(FsError::NotSupported);
        }
        self.inner.source.about().await
    }

    /// Drop every cached directory and object record; the next listings
    /// re-fetch from the source.
    pub fn dir_cache_flush(&self) -> Result<(), FsError> {
        self.inner.meta.flush_dir_cache()?;
        Ok(())
    }

    /// Stop the uploader after its current step, cancel the janitor and
    /// the change poller, and shut the source down.
    pub async fn shutdown(&self) -> Result<(), FsError> {
        if let Some(control) = &self.inner.upload_control {
            let _ = control.send(UploaderControl::Stop).await;
        }
        uploader::unregister(&self.inner.name);
        let upload_task = self.inner.upload_task.lock().unwrap().take();
        if let Some(task) = upload_task {
            let _ = task.await;
        }

        let tasks: Vec<_> = self
            .inner
            .background_tasks
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.inner.source.shutdown().await
    }
}
