//! Local in-process transport for testing
//!
//! `LocalTransport` treats a directory on the local filesystem as the remote
//! store. Remote paths are resolved relative to its root.

use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use markersync_core::{RemoteError, RemoteStore, WriteMode};

/// Local transport for testing (no SSH, operates on local filesystem)
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a new local transport with the given root directory
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn map_io(operation: &'static str, path: &str, e: &std::io::Error) -> RemoteError {
    let path = path.to_string();
    match e.kind() {
        ErrorKind::NotFound => RemoteError::NotFound { path },
        ErrorKind::PermissionDenied => RemoteError::PermissionDenied { path },
        ErrorKind::IsADirectory => RemoteError::IsDirectory { path },
        _ => RemoteError::Failed {
            operation,
            path,
            message: e.to_string(),
        },
    }
}

#[async_trait]
impl RemoteStore for LocalTransport {
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let entries =
            std::fs::read_dir(self.resolve(path)).map_err(|e| map_io("list", path, &e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| map_io("list", path, &e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError> {
        let full_path = self.resolve(path);
        if full_path.is_dir() {
            return Err(RemoteError::IsDirectory { path: path.into() });
        }
        let data = std::fs::read(&full_path).map_err(|e| map_io("read", path, &e))?;
        Ok(Bytes::from(data))
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), RemoteError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(mode == WriteMode::Truncate)
            .append(mode == WriteMode::Append)
            .open(self.resolve(path))
            .map_err(|e| map_io("write", path, &e))?;
        file.write_all(data)
            .map_err(|e| map_io("write", path, &e))?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        let full_path = self.resolve(path);
        if full_path.is_dir() {
            return Err(RemoteError::IsDirectory { path: path.into() });
        }
        std::fs::remove_file(&full_path).map_err(|e| map_io("delete", path, &e))
    }

    async fn stat_size(&self, path: &str) -> Result<u64, RemoteError> {
        let metadata =
            std::fs::metadata(self.resolve(path)).map_err(|e| map_io("stat", path, &e))?;
        if metadata.is_dir() {
            return Err(RemoteError::IsDirectory { path: path.into() });
        }
        Ok(metadata.len())
    }
}
