use std::path::PathBuf;
use std::time::Duration;

use crate::error::FsError;

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_CHUNK_TOTAL_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_CHUNK_CLEAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INFO_AGE: Duration = Duration::from_secs(6 * 3600);
pub const DEFAULT_READ_RETRIES: u32 = 10;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TEMP_WAIT_TIME: Duration = Duration::from_secs(15);
pub const DEFAULT_DB_WAIT_TIME: Duration = Duration::from_secs(1);

/// Tuning knobs of one cache instance.
///
/// Parsing external configuration into this struct is the embedder's
/// business; the cache only validates the combination it is handed.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root for the metadata db file (`<cache_dir>/<name>.db`) and the
    /// chunk tree (`<cache_dir>/<name>/`).
    pub cache_dir: PathBuf,
    /// Fixed chunk size in bytes.
    pub chunk_size: u64,
    /// Upper bound for the on-disk chunk tree, enforced by the janitor.
    pub chunk_total_size: u64,
    /// Janitor tick; also the memory-tier TTL and the change-notification
    /// polling interval.
    pub chunk_clean_interval: Duration,
    /// How long cached directory/object metadata stays fresh.
    pub info_age: Duration,
    /// Download retries per chunk before a worker gives up.
    pub read_retries: u32,
    /// Download workers per open file handle.
    pub workers: usize,
    /// Keep a RAM hot tier in front of the chunk files.
    pub use_memory: bool,
    /// Token-bucket limit on source reads, requests per second. Zero
    /// disables limiting.
    pub rps: u32,
    /// Tee uploads into the chunk store (write-through caching).
    pub store_writes: bool,
    /// Staging root for buffered writes. `None` disables write staging.
    pub temp_upload_path: Option<PathBuf>,
    /// Minimum age of a staged file before the uploader picks it up.
    pub temp_wait_time: Duration,
    /// How long to wait for the metadata store lock. Zero waits forever.
    pub db_wait_time: Duration,
    /// Drop all cached data on startup.
    pub db_purge: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("blobcache"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_total_size: DEFAULT_CHUNK_TOTAL_SIZE,
            chunk_clean_interval: DEFAULT_CHUNK_CLEAN_INTERVAL,
            info_age: DEFAULT_INFO_AGE,
            read_retries: DEFAULT_READ_RETRIES,
            workers: DEFAULT_WORKERS,
            use_memory: true,
            rps: 0,
            store_writes: false,
            temp_upload_path: None,
            temp_wait_time: DEFAULT_TEMP_WAIT_TIME,
            db_wait_time: DEFAULT_DB_WAIT_TIME,
            db_purge: false,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), FsError> {
        if self.chunk_size == 0 {
            return Err(FsError::ConfigInvalid("chunk size must not be zero".into()));
        }
        if self.workers == 0 {
            return Err(FsError::ConfigInvalid(
                "at least one worker is required".into(),
            ));
        }
        // the workers must be able to park one chunk each on disk
        let needed = self.chunk_size * self.workers as u64;
        if self.chunk_total_size < needed {
            return Err(FsError::ConfigInvalid(format!(
                "chunk total size ({}) is less than chunk size ({}) * workers ({})",
                self.chunk_total_size, self.chunk_size, self.workers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        CacheConfig::default().validate().unwrap();
    }

    #[test]
    fn test_total_size_bound() {
        let mut config = CacheConfig {
            chunk_size: 1024,
            chunk_total_size: 4096,
            workers: 4,
            ..CacheConfig::default()
        };
        // exactly chunk_size * workers is accepted
        config.validate().unwrap();

        config.chunk_total_size = 4095;
        assert!(matches!(config.validate(), Err(FsError::ConfigInvalid(_))));

        config.chunk_total_size = 4096;
        config.workers = 0;
        assert!(config.validate().is_err());
    }
}
