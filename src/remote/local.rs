//! A directory-rooted [RemoteFs].
//!
//! This is what backs the write-staging tree; it is deliberately small and
//! boring. Tests use it as a stand-in source as well.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::format_err;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use blobcache_store::types::{self, ObjectInfo};

use crate::error::FsError;
use crate::remote::{DataStream, DirInfo, Entry, Features, RangeReader, RemoteFs};

pub struct LocalFs {
    name: String,
    root: PathBuf,
}

fn mod_time_of(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl LocalFs {
    pub fn new<P: Into<PathBuf>>(name: &str, root: P) -> Result<Self, FsError> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| format_err!("unable to create local fs root {:?} - {}", root, err))?;
        Ok(Self {
            name: name.to_owned(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a normalized remote name.
    pub fn full_path(&self, remote: &str) -> PathBuf {
        let remote = types::normalize(remote);
        if remote.is_empty() {
            self.root.clone()
        } else {
            self.root.join(remote)
        }
    }
}

struct LocalRangeReader {
    file: fs::File,
}

#[async_trait]
impl RangeReader for LocalRangeReader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf).await
    }

    async fn seek_to(&mut self, offset: u64) -> Result<bool, FsError> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(true)
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> Features {
        Features {
            can_move: true,
            can_copy: true,
            can_dir_move: true,
            can_purge: true,
            ..Features::default()
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>, FsError> {
        let dir = types::normalize(dir);
        let full = self.full_path(&dir);

        let metadata = fs::metadata(&full).await?;
        if !metadata.is_dir() {
            return Err(FsError::IsFile);
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&full).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue, // skip non-utf8 names
            };
            let path = types::join(&dir, &name);
            let metadata = item.metadata().await?;
            if metadata.is_dir() {
                entries.push(Entry::Dir(DirInfo {
                    path,
                    mod_time: mod_time_of(&metadata),
                    child_count: None,
                }));
            } else {
                entries.push(Entry::Object(ObjectInfo::new(
                    &path,
                    metadata.len(),
                    mod_time_of(&metadata),
                )));
            }
        }
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(entries)
    }

    async fn new_object(&self, remote: &str) -> Result<ObjectInfo, FsError> {
        let remote = types::normalize(remote);
        let metadata = fs::metadata(self.full_path(&remote)).await?;
        if metadata.is_dir() {
            return Err(FsError::IsDir);
        }
        Ok(ObjectInfo::new(
            &remote,
            metadata.len(),
            mod_time_of(&metadata),
        ))
    }

    async fn open(&self, remote: &str, offset: u64) -> Result<Box<dyn RangeReader>, FsError> {
        let mut file = fs::File::open(self.full_path(remote)).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(LocalRangeReader { file }))
    }

    async fn put(
        &self,
        remote: &str,
        mut data: DataStream,
        _mod_time: i64,
    ) -> Result<ObjectInfo, FsError> {
        let remote = types::normalize(remote);
        let full = self.full_path(&remote);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full).await?;
        tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;
        drop(file);

        self.new_object(&remote).await
    }

    async fn delete(&self, remote: &str) -> Result<(), FsError> {
        fs::remove_file(self.full_path(remote)).await?;
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> Result<(), FsError> {
        fs::create_dir_all(self.full_path(dir)).await?;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> Result<(), FsError> {
        let full = self.full_path(dir);
        let metadata = fs::metadata(&full).await?;
        if !metadata.is_dir() {
            return Err(FsError::IsFile);
        }
        let mut read_dir = fs::read_dir(&full).await?;
        if read_dir.next_entry().await?.is_some() {
            return Err(FsError::DirNotEmpty);
        }
        fs::remove_dir(&full).await?;
        Ok(())
    }

    async fn move_object(&self, src: &str, dest: &str) -> Result<ObjectInfo, FsError> {
        let dest = types::normalize(dest);
        let dest_full = self.full_path(&dest);
        if let Some(parent) = dest_full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.full_path(src), &dest_full).await?;
        self.new_object(&dest).await
    }

    async fn copy_object(&self, src: &str, dest: &str) -> Result<ObjectInfo, FsError> {
        let dest = types::normalize(dest);
        let dest_full = self.full_path(&dest);
        if let Some(parent) = dest_full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(self.full_path(src), &dest_full).await?;
        self.new_object(&dest).await
    }

    async fn dir_move(&self, src: &str, dest: &str) -> Result<(), FsError> {
        let dest_full = self.full_path(dest);
        if let Some(parent) = dest_full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.full_path(src), &dest_full).await?;
        Ok(())
    }

    async fn purge(&self, dir: &str) -> Result<(), FsError> {
        let full = self.full_path(dir);
        if full == self.root {
            // keep the root itself
            let mut read_dir = fs::read_dir(&full).await?;
            while let Some(item) = read_dir.next_entry().await? {
                let path = item.path();
                if item.file_type().await?.is_dir() {
                    fs::remove_dir_all(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
            }
            return Ok(());
        }
        fs::remove_dir_all(&full).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stream(data: &'static [u8]) -> DataStream {
        Box::new(data)
    }

    #[tokio::test]
    async fn test_put_list_get() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new("local", dir.path()).unwrap();

        let info = fs.put("a/hello.txt", stream(b"hello"), 0).await.unwrap();
        assert_eq!(info.path, "a/hello.txt");
        assert_eq!(info.size, 5);

        let entries = fs.list("").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0], Entry::Dir(d) if d.path == "a"));

        let entries = fs.list("a").await.unwrap();
        assert!(matches!(&entries[0], Entry::Object(o) if o.path == "a/hello.txt"));

        let mut reader = fs.open("a/hello.txt", 1).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ello");
        assert!(reader.seek_to(0).await.unwrap());
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        assert!(matches!(
            fs.new_object("missing").await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(fs.new_object("a").await, Err(FsError::IsDir)));
    }

    #[tokio::test]
    async fn test_move_and_rmdir() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new("local", dir.path()).unwrap();

        fs.put("x/one", stream(b"1"), 0).await.unwrap();
        let moved = fs.move_object("x/one", "y/one").await.unwrap();
        assert_eq!(moved.path, "y/one");
        assert!(matches!(fs.new_object("x/one").await, Err(FsError::NotFound)));

        assert!(matches!(fs.rmdir("y").await, Err(FsError::DirNotEmpty)));
        fs.delete("y/one").await.unwrap();
        fs.rmdir("y").await.unwrap();
        assert!(matches!(fs.list("y").await, Err(FsError::NotFound)));
    }
}
