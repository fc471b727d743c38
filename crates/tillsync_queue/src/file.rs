//! File-based queue store for persistent storage.

use crate::error::StorageResult;
use crate::store::{QueueSnapshot, QueueStore};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A file-based queue store.
///
/// The snapshot is a single JSON document. Saves go through a sibling
/// temporary file followed by a rename, so a crash mid-write leaves the
/// previous snapshot intact.
///
/// # Durability
///
/// - `save()` calls `File::sync_all()` before the rename
/// - A missing file loads as the empty snapshot
///
/// # Example
///
/// ```no_run
/// use tillsync_queue::{FileStore, QueueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("queue.json")).unwrap();
/// let snapshot = store.load().unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Opens a file store at the given path.
    ///
    /// The file itself is created lazily on first save; parent
    /// directories are created here if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if parent directories cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl QueueStore for FileStore {
    fn load(&self) -> StorageResult<QueueSnapshot> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(QueueSnapshot::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, snapshot: &QueueSnapshot) -> StorageResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let temp = self.temp_path();

        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
