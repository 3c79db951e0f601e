//! weft-store — durable, transactional storage of the trust graph.
//!
//! One sled database holds identities, trust edges, derived scores, the
//! configuration record, and the fetch-scheduler command table. All
//! mutation is staged on a [`WriteBatch`] and lands atomically on commit;
//! a dropped batch stages nothing. Single-writer semantics are enforced
//! one level up, by the engine lock.

pub mod batch;
pub mod commands;
pub mod db;
pub mod maintenance;

pub use batch::WriteBatch;
pub use commands::{CommandAction, DownloadCommand};
pub use db::GraphDb;
