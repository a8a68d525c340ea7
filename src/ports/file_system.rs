use bytes::Bytes;
use thiserror::Error;

/// Error type for file system operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FileSystemError {
    /// Error when encountering an IO issue
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error when the path exists but is not a regular file
    #[error("Not a regular file: {0}")]
    NotAFile(String),

    /// Error when path is invalid or escapes the root
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for file system operations
pub type FileSystemResult<T> = Result<T, FileSystemError>;

/// FileSystem defines the port (interface) for reading files below a root directory
pub trait FileSystem: Send + Sync + 'static {
    /// Read a whole file
    ///
    /// # Arguments
    /// * `root` - The root directory files are confined to
    /// * `path` - The path to the file relative to the root
    fn read_file(
        &self,
        root: &str,
        path: &str,
    ) -> impl std::future::Future<Output = FileSystemResult<Bytes>> + Send;
}
