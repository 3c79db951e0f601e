//! weft-fetch — the two-tier identity fetch scheduler.
//!
//! The controller routes engine callbacks into start/stop command rows
//! (fast path) and a prioritized edition-hint stream (slow path). The fast
//! downloader reconciles continuous-update subscriptions against the
//! command table; the slow downloader polls hinted editions with bounded
//! concurrency and backoff. Both feed fetched files into the ingestion
//! queue without parsing anything.

pub mod controller;
pub mod fast;
pub mod slow;

pub use controller::{DownloaderController, FetchSchedulerLock};
pub use fast::FastDownloader;
pub use slow::{SlowDownloadMetrics, SlowDownloader};
