use weft_core::types::IdentityId;

/// Derivation context for the URI crypto key. Changing this would fork the
/// address space of every published identity.
const CRYPTO_KEY_CONTEXT: &str = "weft 2025-01-01 uri crypto key";

/// Routing key: BLAKE3 of the Ed25519 verifying key. The network routes
/// requests by this value, and it doubles as the identity id.
pub fn routing_key_from_verifying_key(vk_bytes: &[u8; 32]) -> [u8; 32] {
    *blake3::hash(vk_bytes).as_bytes()
}

/// Symmetric document key slot of the URI, derived from the same keypair.
pub fn crypto_key_from_verifying_key(vk_bytes: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key(CRYPTO_KEY_CONTEXT, vk_bytes)
}

pub fn identity_id_from_verifying_key(vk_bytes: &[u8; 32]) -> IdentityId {
    IdentityId::from_bytes(routing_key_from_verifying_key(vk_bytes))
}
