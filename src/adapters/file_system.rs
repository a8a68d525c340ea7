use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::ports::file_system::{FileSystem, FileSystemError, FileSystemResult};

/// File system adapter confining reads to a root directory
#[derive(Debug, Default, Clone)]
pub struct FileSystemAdapter;

impl FileSystemAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `path` below `root`, rejecting anything that escapes it after symlinks
    async fn resolve(root: &str, path: &str) -> FileSystemResult<PathBuf> {
        let full_path = Path::new(root).join(path.trim_start_matches('/'));

        let canonical_root = tokio::fs::canonicalize(root)
            .await
            .map_err(FileSystemError::IoError)?;
        let canonical_path = tokio::fs::canonicalize(&full_path)
            .await
            .map_err(FileSystemError::IoError)?;

        if !canonical_path.starts_with(&canonical_root) {
            return Err(FileSystemError::InvalidPath(
                "Path traversal attempt detected".to_string(),
            ));
        }

        Ok(canonical_path)
    }
}

impl FileSystem for FileSystemAdapter {
    async fn read_file(&self, root: &str, path: &str) -> FileSystemResult<Bytes> {
        let full_path = Self::resolve(root, path).await?;

        let metadata = tokio::fs::metadata(&full_path)
            .await
            .map_err(FileSystemError::IoError)?;
        if !metadata.is_file() {
            return Err(FileSystemError::NotAFile(path.to_string()));
        }

        tokio::fs::read(&full_path)
            .await
            .map(Bytes::from)
            .map_err(FileSystemError::IoError)
    }
}
