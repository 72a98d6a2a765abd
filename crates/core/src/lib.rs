//! markersync-core: state-marker driven transfer engine
//!
//! Decides, from marker files next to each remote file, which files may be
//! fetched, fetches them, and advances their state by writing new markers.

pub mod cache;
pub mod config;
pub mod content;
pub mod hash;
pub mod list;
pub mod listing;
pub mod marker;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::RunCaches;
pub use config::{ConfigError, DeletePolicy, FileConfig, SyncConfig};
pub use content::{ContentStore, ReadOutcome};
pub use hash::{DigestEngine, StateDigest, marker_digest_hex};
pub use list::Lister;
pub use listing::RemoteListing;
pub use marker::{CheckPolicy, MarkerEvaluator, MarkerStatus, marker_name};
pub use remote::{RemoteError, RemoteStore, WriteMode, remote_join};
pub use sync::{RunOutcome, SyncError, SyncOrchestrator, SyncReport};
