//! MarkerEvaluator: decides which state markers of a payload are satisfied

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::cache::RunCaches;
use crate::listing::RemoteListing;
use crate::remote::{RemoteError, RemoteStore, remote_join};

/// How strictly marker content is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckPolicy {
    /// Presence in the listing is enough
    Skipped,
    /// Empty markers count; non-empty markers must hold the right digest
    #[default]
    Normal,
    /// Only non-empty markers holding the right digest count
    Forced,
}

/// Remote name of the marker for `state` of payload `base`
#[must_use]
pub fn marker_name(base: &str, state: &str) -> String {
    format!("{base}.{state}")
}

/// Outcome of checking a single marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Not in the listing
    Absent,
    /// In the listing; content not inspected
    Present,
    /// Zero bytes, accepted without a digest
    EmptyAccepted,
    /// Zero bytes, rejected because checking is forced
    EmptyRejected,
    /// Content equals the expected combined digest
    DigestMatch,
    /// Content differs from the expected combined digest
    DigestMismatch { expected: String, actual: String },
    /// Listed, but its size could not be determined
    Unreadable { reason: String },
}

impl MarkerStatus {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Present | Self::EmptyAccepted | Self::DigestMatch)
    }
}

/// Checks marker files of one remote directory against a [`CheckPolicy`].
///
/// Reads go through the run caches; nothing remote is ever modified.
pub struct MarkerEvaluator<'a, S: ?Sized> {
    store: &'a S,
    remote_dir: &'a str,
    policy: CheckPolicy,
}

impl<'a, S> MarkerEvaluator<'a, S>
where
    S: RemoteStore + ?Sized,
{
    #[must_use]
    pub fn new(store: &'a S, remote_dir: &'a str, policy: CheckPolicy) -> Self {
        Self {
            store,
            remote_dir,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> CheckPolicy {
        self.policy
    }

    /// The subset of `states` whose markers for `base` are satisfied
    ///
    /// # Errors
    /// Only fatal transport errors are returned
    pub async fn evaluate(
        &self,
        caches: &mut RunCaches,
        base: &str,
        states: &[String],
        listing: &RemoteListing,
    ) -> Result<BTreeSet<String>, RemoteError> {
        let mut satisfied = BTreeSet::new();
        for state in states {
            let status = self.check(caches, base, state, listing).await?;
            if status.is_satisfied() {
                satisfied.insert(state.clone());
            }
        }
        Ok(satisfied)
    }

    /// Check the marker for a single `state` of `base`
    ///
    /// # Errors
    /// Only fatal transport errors are returned
    pub async fn check(
        &self,
        caches: &mut RunCaches,
        base: &str,
        state: &str,
        listing: &RemoteListing,
    ) -> Result<MarkerStatus, RemoteError> {
        let name = marker_name(base, state);
        debug!("Checking for state file '{name}'...");

        if !listing.contains(&name) {
            return Ok(MarkerStatus::Absent);
        }
        if self.policy == CheckPolicy::Skipped {
            debug!("Found state '{state}' of '{base}' (check skipped)");
            return Ok(MarkerStatus::Present);
        }

        let marker_path = remote_join(self.remote_dir, &name);
        let size = match self.store.stat_size(&marker_path).await {
            Ok(size) => size,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Unable to stat state file '{marker_path}': {e}");
                return Ok(MarkerStatus::Unreadable {
                    reason: e.to_string(),
                });
            }
        };

        if size == 0 {
            return Ok(if self.policy == CheckPolicy::Forced {
                info!(
                    "Forced hash digest comparison renders the empty state '{state}' of '{base}' useless, ignoring it"
                );
                MarkerStatus::EmptyRejected
            } else {
                info!("Found state '{state}' of '{base}' (hash digest check omitted, empty state file)");
                MarkerStatus::EmptyAccepted
            });
        }

        let payload_path = remote_join(self.remote_dir, base);
        let expected = caches
            .digests
            .marker_digest(&mut caches.contents, self.store, &payload_path, &name)
            .await?;
        let actual = caches.contents.get(self.store, &marker_path).await?;

        if actual.as_ref() == expected.as_bytes() {
            info!("Found state '{state}' of '{base}' (hash digest matches)");
            Ok(MarkerStatus::DigestMatch)
        } else {
            let actual = String::from_utf8_lossy(&actual).into_owned();
            warn!(
                "Invalid hash digest in state file '{name}' (should be '{expected}', content is '{actual}')"
            );
            Ok(MarkerStatus::DigestMismatch { expected, actual })
        }
    }
}
