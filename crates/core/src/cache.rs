//! Run-scoped caches shared by the evaluator and the orchestrator

use crate::content::ContentStore;
use crate::hash::DigestEngine;

/// The file-content and hash caches of one run.
///
/// Created empty for every run and dropped with it. Remote files are
/// assumed not to change while a run is in progress, so nothing is ever
/// invalidated.
#[derive(Debug, Default)]
pub struct RunCaches {
    pub contents: ContentStore,
    pub digests: DigestEngine,
}

impl RunCaches {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every cached hash and content size at debug level
    pub fn log_summary(&self) {
        for (path, hex) in self.digests.hexes() {
            tracing::debug!("Hash for file '{path}' was '{hex}'");
        }
        for (path, size) in self.contents.sizes() {
            tracing::debug!("File '{path}' had {size} bytes in cache");
        }
    }
}
