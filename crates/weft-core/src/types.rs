use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WotError;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

/// Monotonically increasing sequence number of an identity's published
/// document.
pub type Edition = u64;

/// A trust opinion, in [-100, +100].
pub type TrustValue = i8;

// ── IdentityId ───────────────────────────────────────────────────────────────

/// 32-byte identity identifier: the routing key of the publishing keypair,
/// rendered as unpadded URL-safe Base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub [u8; 32]);

impl IdentityId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, WotError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| WotError::InvalidUri(format!("bad Base64 id: {s}")))?;
        if bytes.len() != 32 {
            return Err(WotError::InvalidUri(format!(
                "id must decode to 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({}…)", &self.to_base64()[..8])
    }
}

// ── TrustId ──────────────────────────────────────────────────────────────────

/// Composite key of a trust edge: `truster@trustee`. The `@` separator never
/// occurs in the Base64 alphabet, so the encoding is unambiguous and
/// prefix-scannable by truster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrustId {
    pub truster: IdentityId,
    pub trustee: IdentityId,
}

impl TrustId {
    pub fn new(truster: IdentityId, trustee: IdentityId) -> Self {
        Self { truster, trustee }
    }

    /// Store key bytes: `<truster b64>@<trustee b64>`.
    pub fn key_bytes(&self) -> Vec<u8> {
        format!("{}@{}", self.truster, self.trustee).into_bytes()
    }

    /// Prefix for scanning every edge leaving `truster`.
    pub fn truster_prefix(truster: &IdentityId) -> Vec<u8> {
        format!("{truster}@").into_bytes()
    }
}

impl fmt::Display for TrustId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.truster, self.trustee)
    }
}

impl fmt::Debug for TrustId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustId({:?} → {:?})", self.truster, self.trustee)
    }
}

// ── ScoreId ──────────────────────────────────────────────────────────────────

/// Composite key of a score: `owner@target`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoreId {
    pub owner: IdentityId,
    pub target: IdentityId,
}

impl ScoreId {
    pub fn new(owner: IdentityId, target: IdentityId) -> Self {
        Self { owner, target }
    }

    pub fn key_bytes(&self) -> Vec<u8> {
        format!("{}@{}", self.owner, self.target).into_bytes()
    }

    /// Prefix for scanning every score in `owner`'s tree.
    pub fn owner_prefix(owner: &IdentityId) -> Vec<u8> {
        format!("{owner}@").into_bytes()
    }
}

impl fmt::Display for ScoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.target)
    }
}

impl fmt::Debug for ScoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScoreId({:?} tree, {:?})", self.owner, self.target)
    }
}
