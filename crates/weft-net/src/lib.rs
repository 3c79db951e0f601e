//! weft-net — the content-network seam.
//!
//! The engine's downloaders and inserter talk to the anonymous
//! content-addressed network only through [`ContentNetwork`]: an
//! update-stream subscription per identity URI, single-edition fetches,
//! and signed inserts. [`MemoryNetwork`] implements the contract
//! in-process for tests and local simulation; a real transport plugs in
//! behind the same trait.

pub mod network;

pub use network::{
    ContentNetwork, FetchOutcome, FetchedEdition, InsertError, MemoryNetwork,
};
