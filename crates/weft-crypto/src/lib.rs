//! weft-crypto — identity keypairs and key derivation.
//!
//! Ed25519 signing keys; the routing key (and thus the identity id) is
//! BLAKE3 of the verifying key. Insert authenticity is the signature plus
//! the routing-key binding checked by [`verify_publisher`].

pub mod hash;
pub mod keypair;

pub use hash::{identity_id_from_verifying_key, routing_key_from_verifying_key};
pub use keypair::{verify_publisher, IdentityKeypair, DEFAULT_URI_SETTINGS};
