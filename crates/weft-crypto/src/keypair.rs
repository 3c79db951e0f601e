use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use weft_core::error::WotError;
use weft_core::types::{Edition, IdentityId};
use weft_core::uri::{InsertUri, RequestUri};

use crate::hash::{
    crypto_key_from_verifying_key, identity_id_from_verifying_key, routing_key_from_verifying_key,
};

/// Settings blob carried in every URI this implementation mints.
pub const DEFAULT_URI_SETTINGS: &str = "AQACAAE";

/// An identity keypair: Ed25519 signing key with derived routing key.
///
/// The request URI is built from public material only; the insert URI
/// embeds the signing seed and must never leave the local store.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a 32-byte signing seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Rebuild from an insert URI (own-identity restore).
    pub fn from_insert_uri(uri: &InsertUri) -> Self {
        Self::from_seed(uri.signing_key)
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity_id(&self) -> IdentityId {
        identity_id_from_verifying_key(&self.verifying_key_bytes())
    }

    pub fn request_uri(&self, edition: Edition) -> RequestUri {
        let vk = self.verifying_key_bytes();
        RequestUri {
            routing_key: routing_key_from_verifying_key(&vk),
            crypto_key: crypto_key_from_verifying_key(&vk),
            settings: DEFAULT_URI_SETTINGS.to_string(),
            edition,
        }
    }

    pub fn insert_uri(&self, edition: Edition) -> InsertUri {
        let vk = self.verifying_key_bytes();
        let seed = Zeroizing::new(self.signing_key.to_bytes());
        InsertUri {
            signing_key: *seed,
            crypto_key: crypto_key_from_verifying_key(&vk),
            settings: DEFAULT_URI_SETTINGS.to_string(),
            edition,
        }
    }

    /// Detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeypair {{ id: {:?} }}", self.identity_id())
    }
}

/// Verify a detached signature and that the verifying key matches the
/// claimed routing key. Both must hold for an insert to be authentic.
pub fn verify_publisher(
    routing_key: &[u8; 32],
    vk_bytes: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), WotError> {
    if routing_key_from_verifying_key(vk_bytes) != *routing_key {
        return Err(WotError::InvalidUri(
            "verifying key does not match routing key".to_string(),
        ));
    }
    let vk = VerifyingKey::from_bytes(vk_bytes)
        .map_err(|e| WotError::Other(format!("bad verifying key: {e}")))?;
    vk.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| WotError::Other("signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_insert_uris_share_crypto_key() {
        let kp = IdentityKeypair::generate();
        let req = kp.request_uri(3);
        let ins = kp.insert_uri(3);
        assert_eq!(req.crypto_key, ins.crypto_key);
        assert_eq!(req.derived_id(), kp.identity_id());
    }

    #[test]
    fn restore_from_insert_uri_yields_same_identity() {
        let kp = IdentityKeypair::generate();
        let restored = IdentityKeypair::from_insert_uri(&kp.insert_uri(0));
        assert_eq!(restored.identity_id(), kp.identity_id());
    }

    #[test]
    fn publisher_verification() {
        let kp = IdentityKeypair::generate();
        let msg = b"edition payload";
        let sig = kp.sign(msg);
        let vk = kp.verifying_key_bytes();
        let rk = kp.request_uri(0).routing_key;

        assert!(verify_publisher(&rk, &vk, msg, &sig).is_ok());
        assert!(verify_publisher(&rk, &vk, b"tampered", &sig).is_err());

        let other = IdentityKeypair::generate();
        assert!(
            verify_publisher(&rk, &other.verifying_key_bytes(), msg, &sig).is_err(),
            "foreign key must not pass the routing-key binding"
        );
    }
}
