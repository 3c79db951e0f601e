//! weft-graph — the trust graph and score engine.
//!
//! Holds the invariants of the (Identity, Trust, Score) model and derives
//! scores incrementally or from scratch; hosts the subscription manager
//! that versions and publishes change notifications after commit; defines
//! the callback surface the downloader controller implements.

pub mod callbacks;
pub mod engine;
pub mod events;
pub mod recompute;

pub use callbacks::{DownloadScheduler, EditionHint, FetchStatus, NullScheduler};
pub use engine::ScoreEngine;
pub use events::{ChangeDomain, ChangeNotification, SubscriptionManager};
