//! Identity URIs.
//!
//! A published identity lives at a signed public-key URI:
//!
//! ```text
//! K@<routingKey>,<cryptoKey>,<settings>/WebOfTrust/<edition>
//! ```
//!
//! The routing key is the Base64-encoded 32-byte key the network routes
//! requests by; it doubles as the identity's id. The insert URI has the same
//! shape with the private signing key in the first slot — it never appears
//! in any published document.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{SEED_IDENTITY_URIS, WOT_NAME};
use crate::error::WotError;
use crate::types::{Edition, IdentityId};

/// The hard-coded seed identities, parsed once. The hard-coded strings are
/// covered by a test, so the parse cannot fail at runtime.
pub static SEED_IDENTITIES: Lazy<Vec<RequestUri>> = Lazy::new(|| {
    SEED_IDENTITY_URIS
        .iter()
        .map(|s| RequestUri::parse(s).expect("hard-coded seed URI is well-formed"))
        .collect()
});

// ── RequestUri ───────────────────────────────────────────────────────────────

/// Public fetch URI of an identity, carrying the current edition.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUri {
    pub routing_key: [u8; 32],
    pub crypto_key: [u8; 32],
    pub settings: String,
    pub edition: Edition,
}

impl RequestUri {
    /// Parse `K@<routing>,<crypto>,<settings>/WebOfTrust/<edition>`.
    pub fn parse(s: &str) -> Result<Self, WotError> {
        let (routing_key, crypto_key, settings, name, edition) = split_uri(s)?;
        if name != WOT_NAME {
            return Err(WotError::InvalidUri(format!("unknown namespace: {name}")));
        }
        Ok(Self {
            routing_key,
            crypto_key,
            settings,
            edition,
        })
    }

    /// The identity id is the routing key itself.
    pub fn derived_id(&self) -> IdentityId {
        IdentityId::from_bytes(self.routing_key)
    }

    pub fn with_edition(&self, edition: Edition) -> Self {
        Self {
            edition,
            ..self.clone()
        }
    }
}

impl fmt::Display for RequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "K@{},{},{}/{}/{}",
            URL_SAFE_NO_PAD.encode(self.routing_key),
            URL_SAFE_NO_PAD.encode(self.crypto_key),
            self.settings,
            WOT_NAME,
            self.edition
        )
    }
}

impl fmt::Debug for RequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestUri({self})")
    }
}

// ── InsertUri ────────────────────────────────────────────────────────────────

/// Private publish URI of an own identity. Same keypair as the request URI;
/// the first slot holds the signing key instead of the routing key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertUri {
    pub signing_key: [u8; 32],
    pub crypto_key: [u8; 32],
    pub settings: String,
    pub edition: Edition,
}

impl InsertUri {
    pub fn parse(s: &str) -> Result<Self, WotError> {
        let (signing_key, crypto_key, settings, name, edition) = split_uri(s)?;
        if name != WOT_NAME {
            return Err(WotError::InvalidUri(format!("unknown namespace: {name}")));
        }
        Ok(Self {
            signing_key,
            crypto_key,
            settings,
            edition,
        })
    }

    pub fn with_edition(&self, edition: Edition) -> Self {
        Self {
            edition,
            ..self.clone()
        }
    }
}

impl fmt::Display for InsertUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "K@{},{},{}/{}/{}",
            URL_SAFE_NO_PAD.encode(self.signing_key),
            URL_SAFE_NO_PAD.encode(self.crypto_key),
            self.settings,
            WOT_NAME,
            self.edition
        )
    }
}

impl fmt::Debug for InsertUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the signing key.
        write!(f, "InsertUri(K@<private>/{}/{})", WOT_NAME, self.edition)
    }
}

// ── Shared parsing ───────────────────────────────────────────────────────────

fn split_uri(s: &str) -> Result<([u8; 32], [u8; 32], String, String, Edition), WotError> {
    let bad = || WotError::InvalidUri(s.to_string());

    let rest = s.strip_prefix("K@").ok_or_else(bad)?;
    let (keys, path) = rest.split_once('/').ok_or_else(bad)?;

    let mut key_parts = keys.splitn(3, ',');
    let first = key_parts.next().ok_or_else(bad)?;
    let crypto = key_parts.next().ok_or_else(bad)?;
    let settings = key_parts.next().ok_or_else(bad)?;

    let (name, edition_str) = path.split_once('/').ok_or_else(bad)?;
    let edition: Edition = edition_str.parse().map_err(|_| bad())?;

    Ok((
        decode_key(first, s)?,
        decode_key(crypto, s)?,
        settings.to_string(),
        name.to_string(),
        edition,
    ))
}

fn decode_key(part: &str, uri: &str) -> Result<[u8; 32], WotError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| WotError::InvalidUri(uri.to_string()))?;
    if bytes.len() != 32 {
        return Err(WotError::InvalidUri(format!(
            "key must be 32 bytes, got {} in {uri}",
            bytes.len()
        )));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
