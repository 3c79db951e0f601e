//! Fast downloader.
//!
//! Maintains a continuous-update subscription for every identity on the
//! fast path: directly trusted (rank ≤ 1) and fetch-eligible, or locally
//! owned and in restore. Engine callbacks never reach the network
//! directly — they stage start/stop command rows that this scheduler
//! drains under the fetch-scheduler lock. Arriving editions go straight
//! into the ingestion queue, unparsed.
//!
//! Shutdown order matters: the command-processing loop exits first, then
//! live subscriptions are cancelled, so no new subscription can appear
//! once shutdown has begun.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_core::identity::FetchState;
use weft_core::types::IdentityId;
use weft_ingest::IdentityFileQueue;
use weft_net::ContentNetwork;
use weft_store::{CommandAction, GraphDb};

use crate::controller::FetchSchedulerLock;

struct Subscription {
    forwarder: JoinHandle<()>,
}

pub struct FastDownloader {
    db: Arc<GraphDb>,
    network: Arc<dyn ContentNetwork>,
    queue: Arc<IdentityFileQueue>,
    scheduler_lock: FetchSchedulerLock,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    subscriptions: HashMap<IdentityId, Subscription>,
}

impl FastDownloader {
    pub fn new(
        db: Arc<GraphDb>,
        network: Arc<dyn ContentNetwork>,
        queue: Arc<IdentityFileQueue>,
        scheduler_lock: FetchSchedulerLock,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            network,
            queue,
            scheduler_lock,
            shutdown,
            poll_interval: Duration::from_secs(1),
            subscriptions: HashMap::new(),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub async fn run(mut self) {
        info!("fast downloader started");
        self.reconcile_from_store().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.process_commands().await;
                }
                _ = self.shutdown.changed() => break,
            }
        }
        // The command job has terminated; only now cancel live
        // subscriptions.
        for (id, subscription) in self.subscriptions.drain() {
            self.network.unsubscribe(&id);
            subscription.forwarder.abort();
        }
        info!("fast downloader stopped");
    }

    /// Rebuild the subscription set from stored state. The command table
    /// only carries deltas, so a fresh process seeds its subscriptions
    /// from the scores: rank ≤ 1 fetch-eligible identities, plus own
    /// identities in restore.
    pub async fn reconcile_from_store(&mut self) {
        let lock = Arc::clone(&self.scheduler_lock);
        let _guard = lock.lock().await;

        let identities = match self.db.iter_identities() {
            Ok(identities) => identities,
            Err(e) => {
                warn!(error = %e, "failed to scan identities for reconciliation");
                return;
            }
        };
        for identity in identities {
            let fast = if identity.is_own() {
                identity.in_restore()
            } else {
                match self.db.scores_of_target(&identity.id) {
                    Ok(scores) => scores.iter().any(|s| s.rank <= 1 && s.should_maybe_fetch()),
                    Err(_) => false,
                }
            };
            if fast {
                self.start(identity.id);
            }
        }
        info!(
            subscriptions = self.subscriptions.len(),
            "fast subscriptions reconciled from store"
        );
    }

    /// Drain the command table and reconcile subscriptions. Held under the
    /// fetch-scheduler lock.
    pub async fn process_commands(&mut self) {
        let lock = Arc::clone(&self.scheduler_lock);
        let _guard = lock.lock().await;

        let commands = match self.db.take_commands() {
            Ok(commands) => commands,
            Err(e) => {
                warn!(error = %e, "failed to read download commands");
                return;
            }
        };
        for command in commands {
            match command.action {
                CommandAction::StartDownload => self.start(command.id),
                CommandAction::StopDownload => self.stop(command.id),
            }
        }
    }

    fn start(&mut self, id: IdentityId) {
        let identity = match self.db.get_identity(&id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                debug!(identity = %id, "start command for vanished identity ignored");
                return;
            }
            Err(e) => {
                warn!(identity = %id, error = %e, "identity lookup failed");
                return;
            }
        };

        if self.subscriptions.contains_key(&id) {
            // Restart only when a refetch is actually pending; a state that
            // became Fetched between request and scheduling means the data
            // already arrived.
            if identity.fetch_state == FetchState::NotFetched {
                self.stop(id);
            } else {
                debug!(identity = %id, "subscription restart skipped, already fetched");
                return;
            }
        }

        let mut rx = self.network.subscribe(&identity.request_uri);
        let queue = Arc::clone(&self.queue);
        let forwarder = tokio::spawn(async move {
            while let Some(edition) = rx.recv().await {
                if let Err(e) = queue.enqueue(&edition.uri, &edition.bytes) {
                    warn!(uri = %edition.uri, error = %e, "failed to enqueue fetched edition");
                }
            }
        });
        self.subscriptions.insert(id, Subscription { forwarder });
        debug!(identity = %id, edition = identity.request_uri.edition, "fast subscription started");
    }

    fn stop(&mut self, id: IdentityId) {
        if let Some(subscription) = self.subscriptions.remove(&id) {
            self.network.unsubscribe(&id);
            subscription.forwarder.abort();
            debug!(identity = %id, "fast subscription stopped");
        }
    }
}
