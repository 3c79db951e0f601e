//! weft-xml — wire codecs for published documents.
//!
//! Identity files (trust lists), identity introductions, and introduction
//! puzzles. All decoders enforce the hard size limits before touching the
//! parser and discard well-formed files of unknown future versions by
//! returning `Ok(None)`.

mod common;
pub mod identity_file;
pub mod introduction;
pub mod puzzle;

pub use identity_file::{
    decode_identity_file, encode_identity_file, IdentityFile, TrustListEntry,
};
pub use introduction::{decode_introduction, encode_introduction, IdentityIntroduction};
pub use puzzle::{decode_puzzle, encode_puzzle, IntroductionPuzzle};
