//! The seam between the sync engine and whatever holds the remote directory

use async_trait::async_trait;
use bytes::Bytes;

/// How `write_file` treats an existing remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace any existing content
    Truncate,
    /// Append to existing content, creating the file if needed
    Append,
}

/// Failures reported by a [`RemoteStore`]
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("no such remote file: {path}")]
    NotFound { path: String },

    #[error("remote path is a directory: {path}")]
    IsDirectory { path: String },

    #[error("permission denied on remote path: {path}")]
    PermissionDenied { path: String },

    #[error("remote {operation} on {path} failed: {message}")]
    Failed {
        operation: &'static str,
        path: String,
        message: String,
    },

    #[error("remote {operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("authentication as {user}@{host} failed: {message}")]
    Auth {
        user: String,
        host: String,
        message: String,
    },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Whether the session can no longer be trusted and the run must stop.
    ///
    /// Per-file failures (missing file, directory, permissions, a refused
    /// write) are not fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Auth { .. } | Self::Transport(_)
        )
    }
}

/// Remote directory primitives needed by the engine.
///
/// Paths are remote pathnames as produced by [`remote_join`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Names (not paths) of the entries in `path`, in server order
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, RemoteError>;

    /// Full content of the file at `path`
    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError>;

    /// Write `data` to `path`
    async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode)
    -> Result<(), RemoteError>;

    /// Remove the file at `path`
    async fn delete_file(&self, path: &str) -> Result<(), RemoteError>;

    /// Size in bytes of the file at `path`
    async fn stat_size(&self, path: &str) -> Result<u64, RemoteError>;
}

/// Join a remote directory and an entry name with `/`.
#[must_use]
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
