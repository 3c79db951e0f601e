//! weft-ingest — identity-file ingestion pipeline.
//!
//! The deduplicating disk-spooled queue of fetched identity files, and the
//! single-threaded processor that decodes them and applies each trust list
//! to the score engine under one transaction per file.

pub mod processor;
pub mod queue;

pub use processor::{IdentityFileProcessor, ProcessorStatistics};
pub use queue::{FetchedFile, IdentityFileQueue, QueueEvent, QueueStatistics};
