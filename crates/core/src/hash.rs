//! SHA-1 state digests and the run-scoped DigestEngine

use std::collections::HashMap;
use std::fmt;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::content::ContentStore;
use crate::remote::{RemoteError, RemoteStore};

/// An in-progress SHA-1 state.
///
/// Holding the hasher (rather than the finished hash) lets a payload
/// digest be extended with a marker name afterwards. Extending always
/// produces a new value; the original is never touched.
#[derive(Clone)]
pub struct StateDigest {
    hasher: Sha1,
}

impl StateDigest {
    /// Digest of arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self { hasher }
    }

    /// A copy of this digest further updated with `data`
    #[must_use]
    pub fn extended(&self, data: &[u8]) -> Self {
        let mut hasher = self.hasher.clone();
        hasher.update(data);
        Self { hasher }
    }

    /// Lowercase hex of the digest so far
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

impl fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "StateDigest({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Strip any directory part from a marker path
#[must_use]
pub fn bare_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Expected content of marker `marker_name` for a payload with `content`
#[must_use]
pub fn marker_digest_hex(content: &[u8], marker_name: &str) -> String {
    StateDigest::from_bytes(content)
        .extended(bare_name(marker_name).as_bytes())
        .to_hex()
}

/// Caches the payload-only digest of every remote file hashed during a run
#[derive(Debug, Default)]
pub struct DigestEngine {
    digests: HashMap<String, StateDigest>,
}

impl DigestEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload digest of `path`, hashing its cached content on first use.
    ///
    /// The returned value is a copy; extending it never alters the cache.
    ///
    /// # Errors
    /// Returns fatal transport errors from the content read
    pub async fn digest_of<S>(
        &mut self,
        contents: &mut ContentStore,
        store: &S,
        path: &str,
    ) -> Result<StateDigest, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        if let Some(digest) = self.digests.get(path) {
            debug!("Hash cache hit for '{path}'");
            return Ok(digest.clone());
        }

        debug!("Hash cache miss for '{path}'");
        let data = contents.get(store, path).await?;
        let digest = StateDigest::from_bytes(&data);
        debug!("Hash for '{path}' is '{digest}'");
        self.digests.insert(path.to_string(), digest.clone());
        Ok(digest)
    }

    /// Combined digest hex expected inside marker `marker_name` of the
    /// payload at `payload_path`
    ///
    /// # Errors
    /// Returns fatal transport errors from the content read
    pub async fn marker_digest<S>(
        &mut self,
        contents: &mut ContentStore,
        store: &S,
        payload_path: &str,
        marker_name: &str,
    ) -> Result<String, RemoteError>
    where
        S: RemoteStore + ?Sized,
    {
        let digest = self.digest_of(contents, store, payload_path).await?;
        Ok(digest.extended(bare_name(marker_name).as_bytes()).to_hex())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Cached pathnames with their payload digest hex
    pub fn hexes(&self) -> impl Iterator<Item = (&str, String)> {
        self.digests
            .iter()
            .map(|(path, digest)| (path.as_str(), digest.to_hex()))
    }
}
