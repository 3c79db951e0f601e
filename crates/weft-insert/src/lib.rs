//! weft-insert — periodic re-publication of own identities.
//!
//! For every own identity not in restore, decides whether the next edition
//! should be inserted: data changed since the last insert, or the identity
//! has been silent long enough that a re-insert serves as a liveness
//! signal. Rapid edits are coalesced; a collision leaves the edition
//! untouched, because the fetcher will catch up and the next cycle retries
//! one edition later.

pub mod inserter;

pub use inserter::{IdentityInserter, InserterStatistics};
