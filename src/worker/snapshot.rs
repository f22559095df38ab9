//! Durable snapshot file of a worker, versioned by modification time.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::utils::RendezvousError;

use bytes::Bytes;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Full copy of a worker's durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Version (modification time in millis) the bytes were read at.
    pub version: u64,

    /// Raw snapshot bytes.
    pub bytes: Bytes,
}

/// Converts file metadata into a snapshot version. Never returns `0` for an
/// existing file, since `0` means "no snapshot" on the wire.
fn version_of(meta: &std::fs::Metadata) -> Result<u64, RendezvousError> {
    let mtime = meta.modified()?;
    let millis = mtime
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RendezvousError::msg(format!("bad mtime: {}", e)))?
        .as_millis();
    Ok(u64::try_from(millis).unwrap_or(u64::MAX).max(1))
}

/// Handle to the snapshot file at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    /// Path of the snapshot file.
    path: PathBuf,
}

impl SnapshotStore {
    /// Creates a handle; the file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotStore { path: path.into() }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current version of the snapshot, `0` if there is none.
    pub async fn version(&self) -> Result<u64, RendezvousError> {
        match fs::metadata(&self.path).await {
            Ok(meta) => version_of(&meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the whole snapshot, `None` if there is none. Version and bytes
    /// come from the same open file, which an install never writes into.
    pub async fn load(&self) -> Result<Option<Snapshot>, RendezvousError> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata().await?;
        let version = version_of(&meta)?;
        let mut buf = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut buf).await?;
        Ok(Some(Snapshot {
            version,
            bytes: Bytes::from(buf),
        }))
    }

    /// Replaces the snapshot with `bytes` atomically: readers see either
    /// the old file or the new one, never a partial write. Returns the new
    /// version.
    pub async fn install(&self, bytes: &[u8]) -> Result<u64, RendezvousError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = self
            .path
            .file_name()
            .ok_or_else(|| {
                RendezvousError::msg(format!(
                    "snapshot path '{}' has no file name",
                    self.path.display()
                ))
            })?
            .to_string_lossy();
        let tmp_path =
            dir.join(format!(".{}.{:08x}.tmp", name, rand::random::<u32>()));

        let written = async {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .await?;
            tmp.write_all(bytes).await?;
            tmp.sync_all().await?;
            fs::rename(&tmp_path, &self.path).await?;
            Ok::<(), RendezvousError>(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let version = self.version().await?;
        pf_debug!(
            "installed snapshot of {} bytes, version {}",
            bytes.len(),
            version
        );
        Ok(version)
    }
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn absent_snapshot() -> Result<(), RendezvousError> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("db.sqlite"));
        assert_eq!(store.version().await?, 0);
        assert_eq!(store.load().await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_then_load() -> Result<(), RendezvousError> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("db.sqlite"));
        let version = store.install(b"hello world").await?;
        assert!(version > 0);
        assert_eq!(store.version().await?, version);

        let snapshot = store.load().await?;
        assert_eq!(
            snapshot,
            Some(Snapshot {
                version,
                bytes: Bytes::from_static(b"hello world"),
            })
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_replaces_and_leaves_no_temp() -> Result<(), RendezvousError>
    {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("db.sqlite"));
        store.install(&[1u8; 4096]).await?;
        store.install(b"short").await?;

        let snapshot = store.load().await?.map(|s| s.bytes);
        assert_eq!(snapshot, Some(Bytes::from_static(b"short")));
        let mut entries = fs::read_dir(dir.path()).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("db.sqlite")]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_into_missing_dir_fails() -> Result<(), RendezvousError> {
        let dir = tempdir()?;
        let store =
            SnapshotStore::new(dir.path().join("missing").join("db.sqlite"));
        assert!(store.install(b"data").await.is_err());
        assert_eq!(store.version().await?, 0);
        Ok(())
    }
}
