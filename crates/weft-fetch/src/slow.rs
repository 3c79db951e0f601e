//! Slow downloader.
//!
//! Handles the long tail: identities known only through edition hints
//! carried in other identities' trust lists. Hints are prioritized by
//! date, then source capacity, then source score, then edition; downloads
//! run with bounded concurrency, retry transient failures with exponential
//! backoff, and give up on editions the network says do not exist.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use weft_core::constants::{
    MAX_RUNNING_DOWNLOADS, SLOW_MAX_RETRIES, SLOW_RETRY_BASE_DELAY_SECS,
    SLOW_RETRY_MAX_DELAY_SECS,
};
use weft_core::identity::FetchState;
use weft_core::score::Score;
use weft_core::types::{Edition, IdentityId};
use weft_graph::callbacks::EditionHint;
use weft_ingest::IdentityFileQueue;
use weft_net::{ContentNetwork, FetchOutcome};
use weft_store::GraphDb;

use crate::controller::FetchSchedulerLock;

// ── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlowDownloadMetrics {
    pub queued: u64,
    pub running: usize,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed_temporarily: u64,
    pub failed_permanently: u64,
    pub data_not_found: u64,
}

enum DownloadOutcome {
    Success(Vec<u8>),
    NotFound,
    GaveUp,
}

struct Finished {
    target: IdentityId,
    edition: Edition,
    outcome: DownloadOutcome,
}

// ── SlowDownloader ───────────────────────────────────────────────────────────

pub struct SlowDownloader {
    db: Arc<GraphDb>,
    network: Arc<dyn ContentNetwork>,
    queue: Arc<IdentityFileQueue>,
    scheduler_lock: FetchSchedulerLock,
    hints: mpsc::UnboundedReceiver<EditionHint>,
    shutdown: watch::Receiver<bool>,
    heap: BinaryHeap<EditionHint>,
    in_flight: HashSet<IdentityId>,
    downloads: JoinSet<Finished>,
    metrics: Arc<Mutex<SlowDownloadMetrics>>,
    max_running: usize,
    retry_base_delay: Duration,
}

impl SlowDownloader {
    pub fn new(
        db: Arc<GraphDb>,
        network: Arc<dyn ContentNetwork>,
        queue: Arc<IdentityFileQueue>,
        scheduler_lock: FetchSchedulerLock,
        hints: mpsc::UnboundedReceiver<EditionHint>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            network,
            queue,
            scheduler_lock,
            hints,
            shutdown,
            heap: BinaryHeap::new(),
            in_flight: HashSet::new(),
            downloads: JoinSet::new(),
            metrics: Arc::new(Mutex::new(SlowDownloadMetrics::default())),
            max_running: MAX_RUNNING_DOWNLOADS,
            retry_base_delay: Duration::from_secs(SLOW_RETRY_BASE_DELAY_SECS as u64),
        }
    }

    pub fn metrics_handle(&self) -> Arc<Mutex<SlowDownloadMetrics>> {
        Arc::clone(&self.metrics)
    }

    /// Shrink delays for tests.
    pub fn set_retry_base_delay(&mut self, delay: Duration) {
        self.retry_base_delay = delay;
    }

    pub async fn run(mut self) {
        info!(max_running = self.max_running, "slow downloader started");
        loop {
            tokio::select! {
                hint = self.hints.recv() => {
                    match hint {
                        Some(hint) => {
                            self.heap.push(hint);
                            self.metrics.lock().expect("metrics lock poisoned").queued += 1;
                            self.launch_ready().await;
                        }
                        None => break, // controller gone
                    }
                }
                Some(result) = self.downloads.join_next(), if !self.downloads.is_empty() => {
                    match result {
                        Ok(finished) => self.handle_finished(finished),
                        Err(e) => warn!(error = %e, "download task panicked"),
                    }
                    self.launch_ready().await;
                }
                _ = self.shutdown.changed() => break,
            }
        }
        self.downloads.abort_all();
        info!("slow downloader stopped");
    }

    /// Pop ready hints and start downloads up to the concurrency bound.
    /// Runs under the fetch-scheduler lock.
    pub async fn launch_ready(&mut self) {
        let lock = Arc::clone(&self.scheduler_lock);
        let _guard = lock.lock().await;

        while self.downloads.len() < self.max_running {
            let Some(hint) = self.heap.pop() else { break };
            if !self.worth_downloading(&hint) {
                self.metrics.lock().expect("metrics lock poisoned").skipped += 1;
                continue;
            }
            self.spawn_download(hint);
        }
        self.metrics.lock().expect("metrics lock poisoned").running = self.downloads.len();
    }

    /// A hint is stale when the identity is gone, already at or past the
    /// hinted edition, no longer fetch-eligible, or already downloading.
    fn worth_downloading(&self, hint: &EditionHint) -> bool {
        if self.in_flight.contains(&hint.target) {
            return false;
        }
        let Ok(Some(identity)) = self.db.get_identity(&hint.target) else {
            return false;
        };
        if identity.request_uri.edition >= hint.edition
            && identity.fetch_state == FetchState::Fetched
        {
            return false;
        }
        match self.db.scores_of_target(&hint.target) {
            Ok(scores) => scores.iter().any(Score::should_maybe_fetch),
            Err(_) => false,
        }
    }

    fn spawn_download(&mut self, hint: EditionHint) {
        let Ok(Some(identity)) = self.db.get_identity(&hint.target) else {
            return;
        };
        let uri = identity.request_uri.with_edition(hint.edition);
        let network = Arc::clone(&self.network);
        let retry_base = self.retry_base_delay;

        self.in_flight.insert(hint.target);
        debug!(target = %hint.target, edition = hint.edition, "hint download started");
        self.downloads.spawn(async move {
            let mut attempt: u32 = 0;
            let outcome = loop {
                let fetch = network.fetch(&uri);
                match fetch.await {
                    Ok(FetchOutcome::Success(bytes)) => break DownloadOutcome::Success(bytes),
                    Ok(FetchOutcome::NotFound) => break DownloadOutcome::NotFound,
                    Ok(FetchOutcome::Transient(reason)) => {
                        attempt += 1;
                        if attempt > SLOW_MAX_RETRIES {
                            warn!(uri = %uri, reason, "download abandoned after retries");
                            break DownloadOutcome::GaveUp;
                        }
                        let max = Duration::from_secs(SLOW_RETRY_MAX_DELAY_SECS as u64);
                        let delay = retry_base
                            .saturating_mul(1 << (attempt - 1).min(16))
                            .min(max);
                        tokio::time::sleep(delay).await;
                    }
                    Err(_) => break DownloadOutcome::GaveUp, // network went away
                }
            };
            Finished {
                target: hint.target,
                edition: hint.edition,
                outcome,
            }
        });
    }

    fn handle_finished(&mut self, finished: Finished) {
        self.in_flight.remove(&finished.target);
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.running = self.downloads.len();

        match finished.outcome {
            DownloadOutcome::Success(bytes) => {
                metrics.succeeded += 1;
                drop(metrics);
                // Hints at or below the downloaded edition are satisfied.
                let (target, edition) = (finished.target, finished.edition);
                self.heap
                    .retain(|h| !(h.target == target && h.edition <= edition));
                if let Ok(Some(identity)) = self.db.get_identity(&target) {
                    let uri = identity.request_uri.with_edition(edition);
                    if let Err(e) = self.queue.enqueue(&uri, &bytes) {
                        warn!(uri = %uri, error = %e, "failed to enqueue downloaded edition");
                    }
                }
            }
            DownloadOutcome::NotFound => {
                metrics.data_not_found += 1;
                metrics.failed_permanently += 1;
                drop(metrics);
                // Only hints naming this exact edition were wrong.
                let (target, edition) = (finished.target, finished.edition);
                self.heap
                    .retain(|h| !(h.target == target && h.edition == edition));
            }
            DownloadOutcome::GaveUp => {
                metrics.failed_temporarily += 1;
            }
        }
    }
}
