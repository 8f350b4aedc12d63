use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;

use crate::types;

/// File system based chunk store.
///
/// Chunks live at `<root>/<objectPath>/<offset>` where `offset` is the
/// chunk-aligned byte position as a decimal integer and the file holds the
/// raw chunk bytes. Inserts go through a temp file plus rename, so readers
/// either see a complete chunk or none at all.
pub struct ChunkStore {
    name: String, // used for error reporting
    root: PathBuf,
    mutex: Mutex<()>,
}

impl ChunkStore {
    pub fn open<P: Into<PathBuf>>(name: &str, root: P) -> Result<Self, Error> {
        let root: PathBuf = root.into();

        if !root.is_absolute() {
            bail!("expected absolute chunk root - got {:?}", root);
        }

        if let Err(err) = fs::create_dir_all(&root) {
            bail!("unable to create chunk store '{}' at {:?} - {}", name, root, err);
        }

        Ok(Self {
            name: name.to_owned(),
            root,
            mutex: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, path: &str) -> PathBuf {
        let path = types::normalize(path);
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    pub fn chunk_path(&self, path: &str, offset: u64) -> PathBuf {
        self.object_dir(path).join(offset.to_string())
    }

    pub fn has_chunk(&self, path: &str, offset: u64) -> bool {
        self.chunk_path(path, offset).is_file()
    }

    /// Read a chunk. Any failure counts as a miss: a partially written or
    /// vanished file simply means the chunk is not materialized yet and the
    /// caller retries.
    pub fn get_chunk(&self, path: &str, offset: u64) -> Option<Bytes> {
        let chunk_path = self.chunk_path(path, offset);
        match fs::read(&chunk_path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                log::warn!(
                    "chunk store '{}': reading {:?} failed - {}",
                    self.name,
                    chunk_path,
                    err
                );
                None
            }
        }
    }

    /// Write a chunk atomically with respect to concurrent readers of the
    /// same file: the bytes land in a temp file that is renamed into place.
    pub fn add_chunk(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), Error> {
        let chunk_path = self.chunk_path(path, offset);
        let dir = chunk_path
            .parent()
            .ok_or_else(|| format_err!("unable to get chunk dir for {:?}", chunk_path))?;

        let _lock = self.mutex.lock().unwrap();

        fs::create_dir_all(dir).map_err(|err| {
            format_err!(
                "chunk store '{}': creating {:?} failed - {}",
                self.name,
                dir,
                err
            )
        })?;

        let tmp_path = dir.join(format!(".{}.tmp", offset));
        fs::write(&tmp_path, data).map_err(|err| {
            format_err!(
                "chunk store '{}': writing {:?} failed - {}",
                self.name,
                tmp_path,
                err
            )
        })?;
        if let Err(err) = fs::rename(&tmp_path, &chunk_path) {
            let _ = fs::remove_file(&tmp_path);
            bail!(
                "chunk store '{}': inserting chunk {:?} failed - {}",
                self.name,
                chunk_path,
                err
            );
        }

        Ok(())
    }

    /// Remove one chunk file. Missing files are fine, the janitor is
    /// idempotent.
    pub fn remove_chunk(&self, path: &str, offset: u64) -> Result<(), Error> {
        let chunk_path = self.chunk_path(path, offset);
        match fs::remove_file(&chunk_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => bail!("removing chunk {:?} failed - {}", chunk_path, err),
        }
        // drop the object dir once its last chunk is gone
        if let Some(dir) = chunk_path.parent() {
            if dir != self.root {
                let _ = fs::remove_dir(dir);
            }
        }
        Ok(())
    }

    /// Remove all chunks of one object.
    pub fn remove_object(&self, path: &str) -> Result<(), Error> {
        let dir = self.object_dir(path);
        if dir == self.root {
            return self.purge();
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("removing chunks under {:?} failed - {}", dir, err),
        }
    }

    /// Remove all chunks below a directory.
    pub fn remove_dir(&self, path: &str) -> Result<(), Error> {
        self.remove_object(path)
    }

    /// Drop the whole chunk tree, keeping the root itself.
    pub fn purge(&self) -> Result<(), Error> {
        let _lock = self.mutex.lock().unwrap();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chunk_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open("test", dir.path()).unwrap();

        assert!(!store.has_chunk("a/b.bin", 0));
        assert_eq!(store.get_chunk("a/b.bin", 0), None);

        store.add_chunk("a/b.bin", 0, b"hello").unwrap();
        assert!(store.has_chunk("a/b.bin", 0));
        assert_eq!(store.get_chunk("a/b.bin", 0).unwrap().as_ref(), b"hello");

        // overwrite in place
        store.add_chunk("a/b.bin", 0, b"world").unwrap();
        assert_eq!(store.get_chunk("a/b.bin", 0).unwrap().as_ref(), b"world");

        store.add_chunk("a/b.bin", 5, b"12345").unwrap();
        store.remove_chunk("a/b.bin", 0).unwrap();
        assert!(!store.has_chunk("a/b.bin", 0));
        assert!(store.has_chunk("a/b.bin", 5));

        // removing a missing chunk is fine
        store.remove_chunk("a/b.bin", 0).unwrap();

        store.remove_object("a/b.bin").unwrap();
        assert!(!store.has_chunk("a/b.bin", 5));

        store.add_chunk("a/c.bin", 0, b"x").unwrap();
        store.purge().unwrap();
        assert!(!store.has_chunk("a/c.bin", 0));
    }

    #[test]
    fn test_chunk_store_relative_root_rejected() {
        assert!(ChunkStore::open("test", "relative/path").is_err());
    }
}
