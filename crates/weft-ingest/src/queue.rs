//! Deduplicating, persistent queue of fetched identity files.
//!
//! Network callbacks enqueue raw XML blobs; the file processor drains them.
//! Each blob is spooled to disk so queued work survives restarts. When a
//! newer edition of the same identity arrives before the older one is
//! polled, the older is discarded — unless `debug_network_dump` is set, in
//! which case nothing is deduplicated and every file is archived for later
//! analysis.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use weft_core::clock::Clock;
use weft_core::error::WotError;
use weft_core::types::{Edition, IdentityId, Timestamp};
use weft_core::uri::RequestUri;

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Queued,
    Deduplicated,
    Failed,
    Polled,
}

/// Cloneable snapshot of queue behaviour over time.
#[derive(Clone, Debug)]
pub struct QueueStatistics {
    pub total_queued: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub current_size: usize,
    /// When this queue started counting.
    pub since: Timestamp,
    /// Bounded time series of recent queue events.
    pub events: VecDeque<(Timestamp, QueueEvent)>,
}

impl QueueStatistics {
    const MAX_EVENTS: usize = 256;

    fn new(since: Timestamp) -> Self {
        Self {
            total_queued: 0,
            deduplicated: 0,
            failed: 0,
            current_size: 0,
            since,
            events: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Timestamp, event: QueueEvent) {
        if self.events.len() == Self::MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back((now, event));
    }

    /// Average files accepted per hour since the queue started.
    pub fn queued_per_hour(&self, now: Timestamp) -> f64 {
        let hours = ((now - self.since).max(1)) as f64 / 3600.0;
        self.total_queued as f64 / hours
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

/// One fetched identity file, as handed to the processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedFile {
    pub uri: RequestUri,
    pub bytes: Vec<u8>,
}

/// Spool-file payload; the URI must survive restarts together with the
/// bytes.
#[derive(serde::Serialize, serde::Deserialize)]
struct SpooledFile {
    uri: String,
    bytes: Vec<u8>,
}

struct PendingEntry {
    uri: RequestUri,
    path: PathBuf,
}

struct QueueInner {
    pending: BTreeMap<(IdentityId, Edition), PendingEntry>,
    stats: QueueStatistics,
    dump_counter: u64,
}

pub struct IdentityFileQueue {
    spool_dir: PathBuf,
    debug_network_dump: bool,
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl IdentityFileQueue {
    /// Open the queue, re-registering any spooled files from a previous
    /// run. Unreadable spool files are dropped and counted as failed.
    pub fn open(
        spool_dir: impl AsRef<Path>,
        debug_network_dump: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WotError> {
        let spool_dir = spool_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&spool_dir).map_err(|e| WotError::Storage(e.to_string()))?;

        let now = clock.now();
        let mut inner = QueueInner {
            pending: BTreeMap::new(),
            stats: QueueStatistics::new(now),
            dump_counter: 0,
        };

        let entries =
            std::fs::read_dir(&spool_dir).map_err(|e| WotError::Storage(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| WotError::Storage(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match read_spooled(&path) {
                Ok(file) => {
                    let key = (file.uri.derived_id(), file.uri.edition);
                    inner.pending.insert(
                        key,
                        PendingEntry {
                            uri: file.uri,
                            path,
                        },
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable spool file");
                    let _ = std::fs::remove_file(&path);
                    inner.stats.failed += 1;
                }
            }
        }
        inner.stats.current_size = inner.pending.len();

        Ok(Self {
            spool_dir,
            debug_network_dump,
            clock,
            inner: Mutex::new(inner),
            notify: Notify::new(),
        })
    }

    /// Accept one fetched file. Wakes the processor when the queue goes
    /// from empty to non-empty.
    pub fn enqueue(&self, uri: &RequestUri, bytes: &[u8]) -> Result<(), WotError> {
        let id = uri.derived_id();
        let edition = uri.edition;
        let now = self.clock.now();

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let was_empty = inner.pending.is_empty();

        if !self.debug_network_dump {
            // An equal or newer edition already queued supersedes this one.
            let superseded = inner
                .pending
                .range((id, edition)..=(id, Edition::MAX))
                .next()
                .is_some();
            if superseded {
                inner.stats.deduplicated += 1;
                inner.stats.record(now, QueueEvent::Deduplicated);
                debug!(identity = %id, edition, "incoming file superseded by queued edition");
                return Ok(());
            }
            // Queued older editions of this identity are now stale.
            let stale: Vec<(IdentityId, Edition)> = inner
                .pending
                .range((id, 0)..(id, edition))
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                if let Some(old) = inner.pending.remove(&key) {
                    let _ = std::fs::remove_file(&old.path);
                    inner.stats.deduplicated += 1;
                    inner.stats.record(now, QueueEvent::Deduplicated);
                }
            }
        }

        let path = self.spool_path(&id, edition, &mut inner);
        let spooled = SpooledFile {
            uri: uri.to_string(),
            bytes: bytes.to_vec(),
        };
        let encoded =
            bincode::serialize(&spooled).map_err(|e| WotError::Serialization(e.to_string()))?;
        if let Err(e) = std::fs::write(&path, encoded) {
            inner.stats.failed += 1;
            inner.stats.record(now, QueueEvent::Failed);
            return Err(WotError::Storage(e.to_string()));
        }

        inner.pending.insert(
            (id, edition),
            PendingEntry {
                uri: uri.clone(),
                path,
            },
        );
        inner.stats.total_queued += 1;
        inner.stats.current_size = inner.pending.len();
        inner.stats.record(now, QueueEvent::Queued);
        drop(inner);

        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Take one pending file, or `None` when the queue is empty.
    pub fn poll(&self) -> Option<FetchedFile> {
        loop {
            let entry = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let entry = inner.pending.pop_first();
                inner.stats.current_size = inner.pending.len();
                if entry.is_some() {
                    let now = self.clock.now();
                    inner.stats.record(now, QueueEvent::Polled);
                }
                entry
            };
            let (_, entry) = entry?;
            match read_spooled(&entry.path) {
                Ok(file) => {
                    let _ = std::fs::remove_file(&entry.path);
                    return Some(file);
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "spool file unreadable, skipping");
                    let _ = std::fs::remove_file(&entry.path);
                    let mut inner = self.inner.lock().expect("queue lock poisoned");
                    inner.stats.failed += 1;
                }
            }
        }
    }

    /// Await the next empty→non-empty transition.
    pub async fn wakeup(&self) {
        self.notify.notified().await;
    }

    /// Whether the processor may skip its deduplication delay.
    pub fn deduplicates(&self) -> bool {
        !self.debug_network_dump
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomic snapshot of the queue statistics.
    pub fn statistics(&self) -> QueueStatistics {
        self.inner.lock().expect("queue lock poisoned").stats.clone()
    }

    fn spool_path(&self, id: &IdentityId, edition: Edition, inner: &mut QueueInner) -> PathBuf {
        if self.debug_network_dump {
            // Every file is kept; a counter keeps re-fetches distinct.
            inner.dump_counter += 1;
            self.spool_dir
                .join(format!("{id}-{edition}-{}.bin", inner.dump_counter))
        } else {
            self.spool_dir.join(format!("{id}-{edition}.bin"))
        }
    }
}

fn read_spooled(path: &Path) -> Result<FetchedFile, WotError> {
    let encoded = std::fs::read(path).map_err(|e| WotError::Storage(e.to_string()))?;
    let spooled: SpooledFile =
        bincode::deserialize(&encoded).map_err(|e| WotError::Serialization(e.to_string()))?;
    Ok(FetchedFile {
        uri: RequestUri::parse(&spooled.uri)?,
        bytes: spooled.bytes,
    })
}
