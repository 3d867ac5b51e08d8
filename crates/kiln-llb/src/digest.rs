//! Content-addressed digests for build-graph operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Stable content hash identifying an operation (`sha256:<hex>`).
///
/// Digests are opaque to the adapter: it only compares them and uses them as
/// map keys. They sort lexicographically, which keeps iteration over
/// digest-keyed maps deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest a canonical operation payload.
    pub fn from_bytes(payload: &[u8]) -> Self {
        Digest(format!("sha256:{}", hex::encode(Sha256::digest(payload))))
    }

    /// Wrap an already-formatted digest string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Digest(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for display names (`sha256:ab12cd34`).
    pub fn short(&self) -> &str {
        let end = (self.0.len()).min("sha256:".len() + 8);
        &self.0[..end]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
