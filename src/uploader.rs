//! Background uploader: drains the durable pending queue into the source.
//!
//! One loop per cache instance with three control states (RUN, PAUSE,
//! STOP). Each step claims the next due entry (the `started` flag flips in
//! the same store transaction), streams the staged file into the source,
//! and cleans up behind itself. Failures roll the claim back and retry on
//! a later tick; observers hear about every attempt on the event channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use blobcache_store::types::{self, CachedObject, PendingUpload};

use crate::error::FsError;
use crate::fs::CacheInner;
use crate::remote::{EntryKind, RemoteFs};

/// Poll cadence while the queue is empty.
const EMPTY_POLL: Duration = Duration::from_secs(1);
/// Poll cadence while paused, waiting for a resume.
const PAUSE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Started,
    Completed,
    Error,
}

/// Observer event, delivered non-blocking (dropped when the channel is
/// full).
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub remote: String,
    pub status: UploadStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderControl {
    Run,
    Pause,
    Stop,
}

lazy_static! {
    static ref UPLOADER_MAP: Mutex<HashMap<String, mpsc::Sender<UploaderControl>>> =
        Mutex::new(HashMap::new());
}

pub(crate) fn register(name: &str, control: mpsc::Sender<UploaderControl>) {
    UPLOADER_MAP
        .lock()
        .unwrap()
        .insert(name.to_owned(), control);
}

pub(crate) fn unregister(name: &str) {
    UPLOADER_MAP.lock().unwrap().remove(name);
}

/// Send a control message to the uploader of the named cache instance.
pub fn control(name: &str, msg: UploaderControl) -> bool {
    match UPLOADER_MAP.lock().unwrap().get(name) {
        Some(sender) => sender.try_send(msg).is_ok(),
        None => false,
    }
}

fn publish(events: &mpsc::Sender<UploadEvent>, remote: &str, status: UploadStatus, error: Option<String>) {
    let event = UploadEvent {
        remote: remote.to_owned(),
        status,
        error,
    };
    if events.try_send(event).is_err() {
        log::debug!("upload observer channel full, dropping event for '{}'", remote);
    }
}

pub(crate) fn start(
    fs: Weak<CacheInner>,
    mut control_rx: mpsc::Receiver<UploaderControl>,
    events: mpsc::Sender<UploadEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = UploaderControl::Run;
        loop {
            while let Ok(msg) = control_rx.try_recv() {
                state = msg;
            }
            match state {
                UploaderControl::Stop => break,
                UploaderControl::Pause => {
                    match tokio::time::timeout(PAUSE_POLL, control_rx.recv()).await {
                        Ok(Some(msg)) => state = msg,
                        Ok(None) => break,
                        Err(_) => {}
                    }
                    continue;
                }
                UploaderControl::Run => {}
            }

            let Some(fs) = fs.upgrade() else { break };
            match fs.meta.next_pending(fs.config.temp_wait_time) {
                Ok(Some(pending)) => {
                    publish(&events, &pending.dest, UploadStatus::Started, None);
                    match upload_one(&fs, &pending).await {
                        Ok(()) => {
                            publish(&events, &pending.dest, UploadStatus::Completed, None)
                        }
                        Err(err) => {
                            log::warn!(
                                "cache '{}': uploading '{}' failed - {}",
                                fs.name,
                                pending.dest,
                                err
                            );
                            if let Err(err) = fs.meta.reset_pending(&pending.dest) {
                                log::warn!(
                                    "cache '{}': pending rollback for '{}' failed - {}",
                                    fs.name,
                                    pending.dest,
                                    err
                                );
                            }
                            publish(
                                &events,
                                &pending.dest,
                                UploadStatus::Error,
                                Some(err.to_string()),
                            );
                        }
                    }
                    drop(fs);
                }
                Ok(None) => {
                    drop(fs);
                    tokio::time::sleep(EMPTY_POLL).await;
                }
                Err(err) => {
                    log::warn!("cache '{}': pending queue scan failed - {}", fs.name, err);
                    drop(fs);
                    tokio::time::sleep(EMPTY_POLL).await;
                }
            }
        }
    })
}

/// Commit one staged file to the source, then tidy up: the staged copy and
/// any newly empty staging parents disappear, the pending record is
/// dropped, the destination's parent listing is expired and the change
/// broadcast.
async fn upload_one(fs: &Arc<CacheInner>, pending: &PendingUpload) -> Result<(), FsError> {
    let staging = fs.staging.as_ref().ok_or(FsError::NotSupported)?;

    let staged_path = staging.full_path(&pending.dest);
    let info = staging.new_object(&pending.dest).await?;
    let file = tokio::fs::File::open(&staged_path).await?;

    let uploaded = fs
        .source
        .put(&pending.dest, Box::new(file), info.mod_time)
        .await?;

    tokio::fs::remove_file(&staged_path).await?;
    remove_empty_parents(staging.root(), &staged_path);

    fs.meta.remove_pending(&pending.dest)?;
    fs.meta.add_object(&CachedObject::new(uploaded))?;
    if let Some(parent) = types::parent(&pending.dest) {
        fs.meta.expire_dir(parent)?;
        fs.notifier.broadcast(parent, EntryKind::Dir);
    }
    Ok(())
}

/// Walk from the removed file up towards the staging root, dropping
/// directories as they become empty.
fn remove_empty_parents(root: &Path, removed: &Path) {
    let mut current = removed.parent();
    while let Some(dir) = current {
        if dir == root {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break; // not empty (or already gone)
        }
        current = dir.parent();
    }
}
