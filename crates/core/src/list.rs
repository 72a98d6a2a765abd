//! Lister: read-only query for files carrying a set of states

use tracing::{debug, info};

use crate::cache::RunCaches;
use crate::listing::RemoteListing;
use crate::marker::{CheckPolicy, MarkerEvaluator, marker_name};
use crate::remote::{RemoteError, RemoteStore};

/// Lists the entries of a remote directory that have all given states.
///
/// Markers are checked for presence only.
pub struct Lister<'a, S: ?Sized> {
    store: &'a S,
    remote_dir: &'a str,
}

impl<'a, S> Lister<'a, S>
where
    S: RemoteStore + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, remote_dir: &'a str) -> Self {
        Self { store, remote_dir }
    }

    /// Names having every marker in `states`, in listing order.
    ///
    /// With no states the raw listing is returned. A marker matched for
    /// one entry is not itself considered as an entry afterwards.
    ///
    /// # Errors
    /// Returns the store's error if the directory cannot be listed
    pub async fn list(&self, states: &[String]) -> Result<Vec<String>, RemoteError> {
        let mut listing = RemoteListing::fetch(self.store, self.remote_dir).await?;
        if states.is_empty() {
            info!("Listing all remote files with no respect to states");
            return Ok(listing.into_names());
        }

        info!("Listing files matching the states {states:?}");
        let evaluator = MarkerEvaluator::new(self.store, self.remote_dir, CheckPolicy::Skipped);
        let mut caches = RunCaches::new();
        let mut selected = Vec::new();

        let candidates: Vec<String> = listing.iter().map(str::to_string).collect();
        for name in candidates {
            if !listing.contains(&name) {
                continue;
            }
            let found = evaluator
                .evaluate(&mut caches, &name, states, &listing)
                .await?;
            for state in &found {
                listing.remove(&marker_name(&name, state));
            }

            if states.iter().all(|s| found.contains(s)) {
                debug!("'{name}' matches all states");
                selected.push(name);
            } else {
                debug!("'{name}' does not match all states");
            }
        }
        Ok(selected)
    }
}
