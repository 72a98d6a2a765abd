//! RemoteListing: the one directory listing a run works from

use crate::remote::{RemoteError, RemoteStore};

/// Ordered names present in the remote directory when the run started.
///
/// Taken once and never re-queried. Deletions performed by the run are
/// applied with [`RemoteListing::remove`], which only affects steps that
/// come after the removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    entries: Vec<String>,
}

impl RemoteListing {
    /// Create a listing from names in server order
    #[must_use]
    pub fn from_names(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Query `dir` on the remote store
    ///
    /// # Errors
    /// Returns the store's error if the directory cannot be listed
    pub async fn fetch<S>(store: &S, dir: &str) -> Result<Self, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        let entries = store.list_directory(dir).await?;
        tracing::debug!("{} remote files found ({entries:?})", entries.len());
        Ok(Self { entries })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }

    /// Drop `name` from the listing. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.entries.iter().position(|e| e == name) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Entries whose name starts with `prefix`, excluding `prefix` itself
    #[must_use]
    pub fn siblings_of(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.starts_with(prefix) && e.as_str() != prefix)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_names(self) -> Vec<String> {
        self.entries
    }
}
