//! In-memory remote store for unit tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::remote::{RemoteError, RemoteStore, WriteMode};

enum Entry {
    File(Vec<u8>),
    Dir,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    reads: HashMap<String, usize>,
    writes: Vec<String>,
    deletes: Vec<String>,
    read_timeout: bool,
    refused_writes: HashSet<String>,
    refused_deletes: HashSet<String>,
}

/// A remote directory tree held in memory that records every mutation
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn split(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.state()
            .entries
            .insert(path.to_string(), Entry::File(data.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        self.state().entries.insert(path.to_string(), Entry::Dir);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().entries.get(path) {
            Some(Entry::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().entries.contains_key(path)
    }

    pub fn read_count(&self, path: &str) -> usize {
        self.state().reads.get(path).copied().unwrap_or(0)
    }

    /// Paths written so far, in call order
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Paths deleted so far, in call order
    pub fn deletes(&self) -> Vec<String> {
        self.state().deletes.clone()
    }

    pub fn fail_reads_with_timeout(&self, enabled: bool) {
        self.state().read_timeout = enabled;
    }

    pub fn refuse_write(&self, path: &str) {
        self.state().refused_writes.insert(path.to_string());
    }

    pub fn refuse_delete(&self, path: &str) {
        self.state().refused_deletes.insert(path.to_string());
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let dir = path.trim_end_matches('/');
        Ok(self
            .state()
            .entries
            .keys()
            .filter_map(|p| {
                let (parent, name) = split(p);
                (parent == dir).then(|| name.to_string())
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError> {
        let mut state = self.state();
        *state.reads.entry(path.to_string()).or_default() += 1;
        if state.read_timeout {
            return Err(RemoteError::Timeout {
                operation: "read",
                secs: 30,
            });
        }
        match state.entries.get(path) {
            Some(Entry::File(data)) => Ok(Bytes::from(data.clone())),
            Some(Entry::Dir) => Err(RemoteError::IsDirectory { path: path.into() }),
            None => Err(RemoteError::NotFound { path: path.into() }),
        }
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        if state.refused_writes.contains(path) {
            return Err(RemoteError::Failed {
                operation: "write",
                path: path.into(),
                message: "disk full".into(),
            });
        }
        state.writes.push(path.to_string());
        let entry = state
            .entries
            .entry(path.to_string())
            .or_insert_with(|| Entry::File(Vec::new()));
        match entry {
            Entry::File(existing) => {
                if mode == WriteMode::Truncate {
                    existing.clear();
                }
                existing.extend_from_slice(data);
                Ok(())
            }
            Entry::Dir => Err(RemoteError::IsDirectory { path: path.into() }),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        if state.refused_deletes.contains(path) {
            return Err(RemoteError::PermissionDenied { path: path.into() });
        }
        state.deletes.push(path.to_string());
        match state.entries.remove(path) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound { path: path.into() }),
        }
    }

    async fn stat_size(&self, path: &str) -> Result<u64, RemoteError> {
        match self.state().entries.get(path) {
            Some(Entry::File(data)) => Ok(data.len() as u64),
            Some(Entry::Dir) => Err(RemoteError::IsDirectory { path: path.into() }),
            None => Err(RemoteError::NotFound { path: path.into() }),
        }
    }
}
