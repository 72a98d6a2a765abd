//! ContentStore: run-scoped cache of remote file content

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::remote::{RemoteError, RemoteStore};

/// Result of reading one remote file
#[derive(Debug)]
pub enum ReadOutcome {
    /// The full file content
    Content(Bytes),
    /// The path could not be read as a file (missing, a directory, no
    /// permission). The session is still healthy.
    Unreadable(RemoteError),
}

impl ReadOutcome {
    /// Read `path`, separating per-file failures from fatal transport errors.
    ///
    /// # Errors
    /// Returns the error if it is fatal for the whole session
    pub async fn read<S>(store: &S, path: &str) -> Result<Self, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        match store.read_file(path).await {
            Ok(data) => Ok(Self::Content(data)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Self::Unreadable(e)),
        }
    }
}

/// Caches the full byte content of every remote file read during a run.
///
/// Unreadable files are remembered as such so they are attempted once.
#[derive(Debug, Default)]
pub struct ContentStore {
    files: HashMap<String, Option<Bytes>>,
}

impl ContentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of `path`, or `None` if it cannot be read as a file.
    ///
    /// The file is read from `store` on first use only.
    ///
    /// # Errors
    /// Only fatal transport errors are returned; anything else is logged
    /// and cached as unreadable.
    pub async fn fetch<S>(
        &mut self,
        store: &S,
        path: &str,
    ) -> Result<Option<Bytes>, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        if let Some(data) = self.files.get(path) {
            debug!("File cache hit for '{path}'");
            return Ok(data.clone());
        }

        debug!("Feeding file cache with '{path}'");
        let data = match ReadOutcome::read(store, path).await? {
            ReadOutcome::Content(data) => {
                debug!("Content of '{path}' is {} bytes", data.len());
                Some(data)
            }
            ReadOutcome::Unreadable(e) => {
                warn!("Failed to read remote file '{path}' ({e})");
                None
            }
        };

        self.files.insert(path.to_string(), data.clone());
        Ok(data)
    }

    /// Content of `path` for digest purposes: an unreadable file hashes
    /// like an empty one.
    ///
    /// # Errors
    /// Only fatal transport errors are returned
    pub async fn get<S>(&mut self, store: &S, path: &str) -> Result<Bytes, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        Ok(self.fetch(store, path).await?.unwrap_or_default())
    }

    /// Cached content, without any remote access
    #[must_use]
    pub fn cached(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path).and_then(Option::as_ref)
    }

    /// Whether `path` was read and found unreadable
    #[must_use]
    pub fn is_unreadable(&self, path: &str) -> bool {
        matches!(self.files.get(path), Some(None))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Cached pathnames with their content size; unreadable files count as 0
    pub fn sizes(&self) -> impl Iterator<Item = (&str, usize)> {
        self.files
            .iter()
            .map(|(path, data)| (path.as_str(), data.as_ref().map_or(0, Bytes::len)))
    }
}
