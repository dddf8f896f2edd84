use crate::storage::{StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Filesystem-based storage backend rooted at one directory
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem storage backend, creating the root if missing
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Keep the path verbatim; canonicalizing resolves symlinks such as
        // /var -> /private/var and breaks comparisons against configured paths.
        Ok(Self { root_path })
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filesystem_storage_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("nested/root");
        let storage = FilesystemStorage::new(&root).expect("Failed to create storage");
        assert_eq!(storage.base_path(), root.as_path());
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).expect("Failed to create storage");

        let rel = Path::new("P1/1.2/1.2.3/CT_1.dcm");
        let written = storage
            .write_atomic(rel, b"payload".to_vec())
            .await
            .expect("Failed to write file");

        assert!(storage.exists(rel));
        assert_eq!(std::fs::read(&written).unwrap(), b"payload");
        let siblings: Vec<_> = std::fs::read_dir(written.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[tokio::test]
    async fn test_move_into_keeps_content() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let source = temp_dir.path().join("in.dcm");
        std::fs::write(&source, b"abc").unwrap();

        let storage = FilesystemStorage::new(temp_dir.path().join("failed")).unwrap();
        let moved = storage
            .move_into(&source, Path::new("batch/sub/in.dcm"))
            .await
            .expect("Failed to move file");

        assert!(!source.exists());
        assert_eq!(std::fs::read(moved).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_append_line() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(temp_dir.path()).unwrap();
        storage.append_line(Path::new("errors.log"), "one").await.unwrap();
        storage.append_line(Path::new("errors.log"), "two\n").await.unwrap();
        let text = std::fs::read_to_string(temp_dir.path().join("errors.log")).unwrap();
        assert_eq!(text, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_remove_missing_file_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        crate::storage::remove_file(&temp_dir.path().join("gone.dcm"))
            .await
            .expect("missing file should not be an error");
    }
}
