//! Scheduled cleanup driver.
//!
//! One timer per cache instance: every tick enforces the on-disk size
//! bound via the ledger walk, sweeps expired memory-tier entries and
//! resets the notified-remotes dedup set. The task holds only a weak
//! reference, so dropping the cache ends the loop.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::fs::CacheInner;

pub(crate) fn start(fs: Weak<CacheInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately, skip it
        loop {
            ticker.tick().await;
            let Some(fs) = fs.upgrade() else { break };
            if let Err(err) = fs.meta.clean_chunks_by_size(fs.config.chunk_total_size) {
                log::warn!("cache '{}': chunk cleanup failed - {}", fs.name, err);
            }
            if let Some(memory) = &fs.memory {
                memory.purge_expired(interval);
            }
            fs.notifier.clear_notified();
        }
    })
}
