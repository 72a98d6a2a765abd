//! SyncOrchestrator: one pass over the remote listing
//!
//! For every listed entry the orchestrator
//! 1. skips it when all requested next states are already satisfied,
//! 2. skips it unless all previous states are satisfied,
//! 3. writes the payload locally,
//! 4. creates the missing next-state markers,
//! 5. applies the configured deletion policy.
//!
//! Under dry-run every mutating step is logged and counted but not performed.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::cache::RunCaches;
use crate::config::SyncConfig;
use crate::listing::RemoteListing;
use crate::marker::{MarkerEvaluator, marker_name};
use crate::remote::{RemoteError, RemoteStore, WriteMode, remote_join};

/// Errors that end a run early
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local directory {path} is not usable: {source}")]
    LocalDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a run ended, from the caller's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Fetching was requested but no file qualified
    NothingFetched,
    /// Only state advancement was requested and no marker was created
    NothingAdvanced,
}

/// What a run did (or, under dry-run, would have done)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetch_requested: bool,
    pub dry_run: bool,
    /// Payloads written locally, in listing order
    pub fetched: Vec<String>,
    pub fetched_bytes: u64,
    /// Names of the marker files created
    pub markers_created: Vec<String>,
    /// Remote entries deleted
    pub deleted: Vec<String>,
    /// Entries skipped because all next states were already reached
    pub already_processed: Vec<String>,
    /// Entries whose previous states were not all satisfied
    pub unmet: usize,
    /// Payloads or markers whose processing failed
    pub failed: Vec<String>,
}

impl SyncReport {
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.fetch_requested {
            if self.fetched.is_empty() {
                RunOutcome::NothingFetched
            } else {
                RunOutcome::Success
            }
        } else if self.markers_created.is_empty() {
            RunOutcome::NothingAdvanced
        } else {
            RunOutcome::Success
        }
    }
}

/// Drives one run against a [`RemoteStore`].
///
/// Owns the run caches; they live exactly as long as the orchestrator.
pub struct SyncOrchestrator<'a, S: ?Sized> {
    store: &'a S,
    config: &'a SyncConfig,
    caches: RunCaches,
}

impl<'a, S> SyncOrchestrator<'a, S>
where
    S: RemoteStore + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, config: &'a SyncConfig) -> Self {
        Self {
            store,
            config,
            caches: RunCaches::new(),
        }
    }

    #[must_use]
    pub fn caches(&self) -> &RunCaches {
        &self.caches
    }

    /// List the remote directory once and process every entry in it
    ///
    /// # Errors
    /// Returns an error on fatal transport failures or when the local
    /// directory cannot receive files
    pub async fn run(&mut self) -> Result<SyncReport, SyncError> {
        let config = self.config;
        info!(
            "Fetching files from remote directory '{}' matching previous states {:?}, next states {:?}",
            config.remote_dir, config.previous_states, config.next_states
        );

        if config.fetch_requested() && !config.dry_run {
            check_local_dir(&config.local_dir)?;
        }

        let mut listing = RemoteListing::fetch(self.store, &config.remote_dir).await?;
        let mut report = SyncReport {
            fetch_requested: config.fetch_requested(),
            dry_run: config.dry_run,
            ..SyncReport::default()
        };

        let candidates: Vec<String> = listing.iter().map(str::to_string).collect();
        for name in candidates {
            if !listing.contains(&name) {
                debug!("Skipping '{name}', it was removed earlier in this run");
                continue;
            }
            if name == "." || name == ".." {
                continue;
            }
            self.process(&name, &mut listing, &mut report).await?;
        }

        match report.outcome() {
            RunOutcome::NothingFetched => info!("No files got fetched"),
            RunOutcome::NothingAdvanced => info!("No next states have been created"),
            RunOutcome::Success if report.fetch_requested => {
                info!("Just fetched the following local files {:?}", report.fetched);
            }
            RunOutcome::Success => {
                info!("Created {} next state files", report.markers_created.len());
            }
        }
        Ok(report)
    }

    async fn process(
        &mut self,
        name: &str,
        listing: &mut RemoteListing,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let store = self.store;
        let config = self.config;
        let evaluator = MarkerEvaluator::new(store, &config.remote_dir, config.check_policy);
        debug!("Checking file '{name}' for states...");

        let next_found = evaluator
            .evaluate(&mut self.caches, name, &config.next_states, listing)
            .await?;
        if !config.next_states.is_empty() && all_found(&config.next_states, &next_found) {
            info!("Skipping '{name}' because all next states are already reached");
            report.already_processed.push(name.to_string());
            return Ok(());
        }

        let previous_found = evaluator
            .evaluate(&mut self.caches, name, &config.previous_states, listing)
            .await?;
        if !all_found(&config.previous_states, &previous_found) {
            debug!("'{name}' does not have all previous states");
            report.unmet += 1;
            return Ok(());
        }

        let payload_path = remote_join(&config.remote_dir, name);

        // An unreadable payload is neither fetched nor advanced
        let Some(data) = self.caches.contents.fetch(store, &payload_path).await? else {
            error!("Remote file '{payload_path}' cannot be read, leaving it untouched");
            report.failed.push(name.to_string());
            return Ok(());
        };

        if config.no_fetch {
            info!("Not fetching '{payload_path}' (no-fetch)");
        } else {
            let local_path = config.local_dir.join(name);
            if config.dry_run {
                info!(
                    "!Dry-run! Not fetching '{payload_path}' to '{}'",
                    local_path.display()
                );
            } else {
                info!("Fetching '{payload_path}' to '{}'", local_path.display());
                if let Err(e) = write_local(&local_path, &data) {
                    error!("Failed to write '{}': {e}", local_path.display());
                    report.failed.push(name.to_string());
                    return Ok(());
                }
            }
            report.fetched.push(name.to_string());
            report.fetched_bytes += data.len() as u64;
        }

        for state in &config.next_states {
            if next_found.contains(state) {
                continue;
            }
            self.create_marker(name, state, &payload_path, report)
                .await?;
        }

        if config.delete.remote_file {
            self.delete(name, listing, report).await?;
        }
        if config.delete.all_statefiles {
            self.delete_empty_siblings(name, listing, report).await?;
        } else if config.delete.previous_statefiles {
            for state in &config.previous_states {
                self.delete(&marker_name(name, state), listing, report)
                    .await?;
            }
        }

        Ok(())
    }

    async fn create_marker(
        &mut self,
        name: &str,
        state: &str,
        payload_path: &str,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let store = self.store;
        let config = self.config;
        let marker = marker_name(name, state);
        let marker_path = remote_join(&config.remote_dir, &marker);
        let digest = self
            .caches
            .digests
            .marker_digest(&mut self.caches.contents, store, payload_path, &marker)
            .await?;

        if config.dry_run {
            info!("!Dry-run! Not creating remote state '{state}' ('{marker_path}' with '{digest}')");
            report.markers_created.push(marker);
            return Ok(());
        }

        debug!("Writing hash '{digest}' to next state file '{marker_path}'");
        match store
            .write_file(&marker_path, digest.as_bytes(), WriteMode::Truncate)
            .await
        {
            Ok(()) => {
                info!("Created remote state '{state}' for '{name}'");
                report.markers_created.push(marker);
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                error!("Failed to create state file '{marker_path}': {e}");
                report.failed.push(marker);
            }
        }
        Ok(())
    }

    /// Delete the remote entry `name`, dropping it from the listing on success
    async fn delete(
        &mut self,
        name: &str,
        listing: &mut RemoteListing,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let path = remote_join(&self.config.remote_dir, name);

        if self.config.dry_run {
            info!("!Dry-run! Not deleting remote file '{path}'");
            listing.remove(name);
            report.deleted.push(name.to_string());
            return Ok(());
        }

        match self.store.delete_file(&path).await {
            Ok(()) => {
                info!("Deleted remote file '{path}'");
                listing.remove(name);
                report.deleted.push(name.to_string());
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => error!("Failed to delete remote file '{path}': {e}"),
        }
        Ok(())
    }

    /// Delete every empty listing entry whose name starts with `name`.
    ///
    /// Non-empty entries are kept, which includes markers holding a digest.
    async fn delete_empty_siblings(
        &mut self,
        name: &str,
        listing: &mut RemoteListing,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        for sibling in listing.siblings_of(name) {
            let path = remote_join(&self.config.remote_dir, &sibling);
            let size = match self.store.stat_size(&path).await {
                Ok(size) => size,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    error!("Failed to stat remote file '{path}': {e}");
                    continue;
                }
            };
            if size == 0 {
                self.delete(&sibling, listing, report).await?;
            } else {
                warn!("Not deleting remote file '{path}', because it is not an empty file");
            }
        }
        Ok(())
    }
}

fn all_found(states: &[String], found: &BTreeSet<String>) -> bool {
    states.iter().all(|s| found.contains(s))
}

fn check_local_dir(path: &Path) -> Result<(), SyncError> {
    let metadata = std::fs::metadata(path).map_err(|source| SyncError::LocalDir {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.is_dir() {
        Ok(())
    } else {
        Err(SyncError::LocalDir {
            path: path.to_path_buf(),
            source: std::io::Error::other("not a directory"),
        })
    }
}

/// Replace `path` with `data` via a temporary file in the same directory
fn write_local(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    // Temp files are created owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::marker_digest_hex;
    use crate::marker::CheckPolicy;
    use crate::testing::MemoryStore;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"id,value\n1,42\n";

    fn config(local: &Path) -> SyncConfig {
        SyncConfig {
            remote_dir: "in".into(),
            local_dir: local.to_path_buf(),
            previous_states: vec!["RECEIVED".into()],
            next_states: vec!["SENT".into()],
            ..SyncConfig::default()
        }
    }

    /// `report.csv` with an empty RECEIVED marker and no SENT marker
    fn received_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.put("in/report.csv", PAYLOAD);
        store.put("in/report.csv.RECEIVED", b"");
        store
    }

    async fn run(store: &MemoryStore, config: &SyncConfig) -> SyncReport {
        SyncOrchestrator::new(store, config).run().await.unwrap()
    }

    #[tokio::test]
    async fn test_fetch_and_advance() {
        let local = TempDir::new().unwrap();
        let store = received_store();

        let report = run(&store, &config(local.path())).await;

        assert_eq!(report.outcome(), RunOutcome::Success);
        assert_eq!(report.fetched, vec!["report.csv".to_string()]);
        assert_eq!(report.fetched_bytes, PAYLOAD.len() as u64);
        assert_eq!(report.markers_created, vec!["report.csv.SENT".to_string()]);
        assert_eq!(std::fs::read(local.path().join("report.csv")).unwrap(), PAYLOAD);
        assert_eq!(
            store.content("in/report.csv.SENT").unwrap(),
            marker_digest_hex(PAYLOAD, "report.csv.SENT").into_bytes()
        );
        // The RECEIVED marker was evaluated as a payload and failed its own states
        assert_eq!(report.unmet, 1);
    }

    #[tokio::test]
    async fn test_already_advanced_file_is_skipped() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put(
            "in/report.csv.SENT",
            marker_digest_hex(PAYLOAD, "report.csv.SENT").as_bytes(),
        );

        let report = run(&store, &config(local.path())).await;

        assert_eq!(report.outcome(), RunOutcome::NothingFetched);
        assert_eq!(report.already_processed, vec!["report.csv".to_string()]);
        assert!(store.writes().is_empty());
        assert!(!local.path().join("report.csv").exists());
    }

    #[tokio::test]
    async fn test_next_state_short_circuits_unmet_previous_state() {
        let local = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put("in/report.csv", PAYLOAD);
        store.put("in/report.csv.SENT", b"");
        let mut config = config(local.path());
        config.delete.previous_statefiles = true;

        let report = run(&store, &config).await;

        assert_eq!(report.already_processed, vec!["report.csv".to_string()]);
        assert_eq!(report.unmet, 1);
        assert!(store.writes().is_empty());
        assert!(store.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_previous_state_blocks_fetch() {
        let local = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put("in/report.csv", PAYLOAD);
        store.put("in/report.csv.RECEIVED", b"0123456789abcdef");

        let report = run(&store, &config(local.path())).await;

        assert_eq!(report.outcome(), RunOutcome::NothingFetched);
        assert_eq!(report.unmet, 2);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        let config = config(local.path());

        let first = run(&store, &config).await;
        let writes_after_first = store.writes().len();
        let second = run(&store, &config).await;

        assert_eq!(first.fetched.len(), 1);
        assert!(second.fetched.is_empty());
        assert!(second.markers_created.is_empty());
        assert_eq!(second.outcome(), RunOutcome::NothingFetched);
        assert_eq!(store.writes().len(), writes_after_first);
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing_and_matches_real_run() {
        let dry_local = TempDir::new().unwrap();
        let real_local = TempDir::new().unwrap();
        let dry_store = received_store();
        let real_store = received_store();

        let mut dry_config = config(dry_local.path());
        dry_config.dry_run = true;
        dry_config.delete.previous_statefiles = true;
        let mut real_config = config(real_local.path());
        real_config.delete.previous_statefiles = true;

        let dry = run(&dry_store, &dry_config).await;
        let real = run(&real_store, &real_config).await;

        assert!(dry_store.writes().is_empty());
        assert!(dry_store.deletes().is_empty());
        assert!(!dry_local.path().join("report.csv").exists());
        assert_eq!(dry.fetched, real.fetched);
        assert_eq!(dry.markers_created, real.markers_created);
        assert_eq!(dry.deleted, real.deleted);
        assert_eq!(dry.outcome(), real.outcome());
    }

    #[tokio::test]
    async fn test_no_fetch_only_advances_state() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        let mut config = config(local.path());
        config.no_fetch = true;

        let first = run(&store, &config).await;
        let second = run(&store, &config).await;

        assert_eq!(first.outcome(), RunOutcome::Success);
        assert!(first.fetched.is_empty());
        assert_eq!(first.markers_created.len(), 1);
        assert!(!local.path().join("report.csv").exists());
        assert_eq!(second.outcome(), RunOutcome::NothingAdvanced);
    }

    #[tokio::test]
    async fn test_only_missing_next_states_are_created() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put("in/report.csv.ARCHIVED", b"");
        let mut config = config(local.path());
        config.next_states = vec!["ARCHIVED".into(), "SENT".into()];

        let report = run(&store, &config).await;

        assert_eq!(report.markers_created, vec!["report.csv.SENT".to_string()]);
        assert_eq!(store.writes(), vec!["in/report.csv.SENT".to_string()]);
        assert_eq!(store.content("in/report.csv.ARCHIVED").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_forced_check_rewrites_empty_next_state() {
        let local = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put("in/report.csv", PAYLOAD);
        store.put(
            "in/report.csv.RECEIVED",
            marker_digest_hex(PAYLOAD, "report.csv.RECEIVED").as_bytes(),
        );
        store.put("in/report.csv.SENT", b"");
        let mut config = config(local.path());
        config.check_policy = CheckPolicy::Forced;

        let report = run(&store, &config).await;

        assert_eq!(report.fetched, vec!["report.csv".to_string()]);
        assert_eq!(
            store.content("in/report.csv.SENT").unwrap(),
            marker_digest_hex(PAYLOAD, "report.csv.SENT").into_bytes()
        );
    }

    #[tokio::test]
    async fn test_delete_previous_statefiles() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put("in/report.csv.CHECKED", b"");
        store.refuse_delete("in/report.csv.CHECKED");
        let mut config = config(local.path());
        config.previous_states = vec!["CHECKED".into(), "RECEIVED".into()];
        config.delete.previous_statefiles = true;

        let report = run(&store, &config).await;

        assert_eq!(report.deleted, vec!["report.csv.RECEIVED".to_string()]);
        assert!(!store.exists("in/report.csv.RECEIVED"));
        assert!(store.exists("in/report.csv.CHECKED"));
        assert!(store.exists("in/report.csv"));
        // CHECKED is still listed and gets evaluated; RECEIVED no longer is
        assert_eq!(report.unmet, 1);
    }

    #[tokio::test]
    async fn test_delete_remote_file_and_empty_statefiles() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put(
            "in/report.csv.SIGNED",
            marker_digest_hex(PAYLOAD, "report.csv.SIGNED").as_bytes(),
        );
        store.put("in/report.csv.tmp", b"");
        store.put("in/other.csv", b"x");
        let mut config = config(local.path());
        config.next_states.clear();
        config.delete.remote_file = true;
        config.delete.all_statefiles = true;

        let report = run(&store, &config).await;

        assert_eq!(report.fetched, vec!["report.csv".to_string()]);
        assert!(!store.exists("in/report.csv"));
        assert!(!store.exists("in/report.csv.RECEIVED"));
        assert!(!store.exists("in/report.csv.tmp"));
        assert!(store.exists("in/report.csv.SIGNED"));
        assert!(store.exists("in/other.csv"));
    }

    #[tokio::test]
    async fn test_empty_statefile_cleanup_keeps_directories() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put_dir("in/report.csv.parts");
        let mut config = config(local.path());
        config.next_states.clear();
        config.delete.remote_file = true;
        config.delete.all_statefiles = true;

        let report = run(&store, &config).await;

        assert_eq!(report.fetched, vec!["report.csv".to_string()]);
        assert!(store.exists("in/report.csv.parts"));
        assert!(!store.deletes().contains(&"in/report.csv.parts".to_string()));
        assert!(!store.exists("in/report.csv.RECEIVED"));
    }

    #[tokio::test]
    async fn test_local_write_failure_skips_markers() {
        let local = TempDir::new().unwrap();
        std::fs::create_dir(local.path().join("report.csv")).unwrap();
        let store = received_store();

        let report = run(&store, &config(local.path())).await;

        assert_eq!(report.failed, vec!["report.csv".to_string()]);
        assert!(report.fetched.is_empty());
        assert!(store.writes().is_empty());
        assert_eq!(report.outcome(), RunOutcome::NothingFetched);
    }

    #[tokio::test]
    async fn test_marker_write_failure_does_not_stop_other_markers() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.refuse_write("in/report.csv.A");
        let mut config = config(local.path());
        config.next_states = vec!["A".into(), "B".into()];

        let report = run(&store, &config).await;

        assert_eq!(report.failed, vec!["report.csv.A".to_string()]);
        assert_eq!(report.markers_created, vec!["report.csv.B".to_string()]);
        assert!(store.exists("in/report.csv.B"));
    }

    #[tokio::test]
    async fn test_timeout_aborts_run() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.fail_reads_with_timeout(true);
        let config = config(local.path());

        let err = SyncOrchestrator::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote(RemoteError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_local_dir_is_reported_before_listing() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        let config = config(&local.path().join("absent"));

        let err = SyncOrchestrator::new(&store, &config)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LocalDir { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_entries_do_not_abort_run() {
        let local = TempDir::new().unwrap();
        let store = received_store();
        store.put_dir("in/archive");
        store.put("in/archive.RECEIVED", b"deadbeef");
        let mut config = config(local.path());
        config.check_policy = CheckPolicy::Forced;
        store.put(
            "in/report.csv.RECEIVED",
            marker_digest_hex(PAYLOAD, "report.csv.RECEIVED").as_bytes(),
        );

        let report = run(&store, &config).await;

        assert_eq!(report.fetched, vec!["report.csv".to_string()]);
        assert_eq!(store.read_count("in/archive"), 1);
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_neither_fetched_nor_advanced() {
        let local = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put_dir("in/archive");
        store.put("in/archive.RECEIVED", b"");

        let report = run(&store, &config(local.path())).await;

        assert!(report.fetched.is_empty());
        assert!(report.markers_created.is_empty());
        assert_eq!(report.failed, vec!["archive".to_string()]);
        assert_eq!(report.outcome(), RunOutcome::NothingFetched);
        assert!(!local.path().join("archive").exists());
        assert!(!store.exists("in/archive.SENT"));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_not_advanced_without_fetch() {
        let local = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.put("in/gone.csv.RECEIVED", b"");
        let mut config = config(local.path());
        config.no_fetch = true;
        // listed, but gone before it could be read
        let mut listing = RemoteListing::from_names(vec![
            "gone.csv".to_string(),
            "gone.csv.RECEIVED".to_string(),
        ]);
        let mut orchestrator = SyncOrchestrator::new(&store, &config);
        let mut report = SyncReport::default();

        orchestrator
            .process("gone.csv", &mut listing, &mut report)
            .await
            .unwrap();

        assert_eq!(report.failed, vec!["gone.csv".to_string()]);
        assert!(report.markers_created.is_empty());
        assert!(store.writes().is_empty());
    }
}
