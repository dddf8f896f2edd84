use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub mod filesystem;
pub mod layout;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path error: {0}")]
    Path(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// File operations rooted at a base directory
///
/// Writes are atomic (temp file in the target directory, then rename), so a
/// reader never observes a half-written object.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Create a subpath relative to the storage root
    fn subpath_path(&self, path: &Path) -> PathBuf {
        self.base_path().join(path)
    }

    /// Ensure a directory exists under the storage root, creating it if necessary
    async fn ensure_dir(&self, path: &Path) -> StorageResult<PathBuf> {
        let full_path = self.subpath_path(path);
        tokio::fs::create_dir_all(&full_path)
            .await
            .map_err(|e| StorageError::io(&full_path, e))?;
        Ok(full_path)
    }

    /// Write bytes to `path` under the root via a temp file and rename
    async fn write_atomic(&self, path: &Path, contents: Vec<u8>) -> StorageResult<PathBuf> {
        let full_path = self.subpath_path(path);
        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::Path(format!("{} has no parent", full_path.display())))?;
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io(&parent, e))?;

        let target = full_path.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            use std::io::Write;
            let mut tmp = tempfile::Builder::new()
                .prefix(".incoming-")
                .tempfile_in(&parent)
                .map_err(|e| StorageError::io(&parent, e))?;
            tmp.write_all(&contents)
                .and_then(|_| tmp.as_file().sync_all())
                .map_err(|e| StorageError::io(tmp.path(), e))?;
            tmp.persist(&target)
                .map_err(|e| StorageError::io(&target, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Path(format!("write task failed: {}", e)))??;

        Ok(full_path)
    }

    /// Move an existing file to `dest` under the root, falling back to copy and delete across devices
    async fn move_into(&self, source: &Path, dest: &Path) -> StorageResult<PathBuf> {
        let target = self.subpath_path(dest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        if tokio::fs::rename(source, &target).await.is_ok() {
            return Ok(target);
        }

        let (from, to) = (source.to_path_buf(), target.clone());
        tokio::task::spawn_blocking(move || {
            let mut options = fs_extra::file::CopyOptions::new();
            options.overwrite = true;
            fs_extra::file::move_file(&from, &to, &options)
                .map(|_| ())
                .map_err(|e| StorageError::Path(format!("move {} -> {}: {}", from.display(), to.display(), e)))
        })
        .await
        .map_err(|e| StorageError::Path(format!("move task failed: {}", e)))??;

        Ok(target)
    }

    /// Append one line to a log file under the root
    async fn append_line(&self, path: &Path, line: &str) -> StorageResult<()> {
        let full_path = self.subpath_path(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)
            .await
            .map_err(|e| StorageError::io(&full_path, e))?;
        file.write_all(format!("{}\n", line.trim_end()).as_bytes())
            .await
            .map_err(|e| StorageError::io(&full_path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&full_path, e))
    }

    /// Check if a file exists at the given relative path
    fn exists(&self, path: &Path) -> bool {
        self.subpath_path(path).exists()
    }
}

/// Delete a file; a file that is already gone is not an error
pub async fn remove_file(path: &Path) -> StorageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}
