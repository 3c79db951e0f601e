//! Downloader controller.
//!
//! Routes engine callbacks to the two downloaders by a fixed policy: fast-
//! path eligibility changes become start/stop command rows for the fast
//! downloader; edition hints from positive-capacity sources flow to the
//! slow downloader; own-identity lifecycle events touch both. Everything
//! here runs inside the engine transaction, so external effects are
//! confined to command rows (which commit or vanish with the transaction)
//! and to a hint buffer that is only released after commit.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use weft_core::error::WotError;
use weft_core::identity::Identity;
use weft_graph::callbacks::{DownloadScheduler, EditionHint, FetchStatus};
use weft_store::{DownloadCommand, WriteBatch};

/// Serializes subscription reconciliation between the fast and slow
/// schedulers.
pub type FetchSchedulerLock = Arc<tokio::sync::Mutex<()>>;

pub struct DownloaderController {
    scheduler_lock: FetchSchedulerLock,
    /// Hints observed inside the open transaction.
    pending_hints: Mutex<Vec<EditionHint>>,
    hint_tx: mpsc::UnboundedSender<EditionHint>,
}

impl DownloaderController {
    /// Returns the controller plus the hint stream consumed by the slow
    /// downloader.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EditionHint>) {
        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            scheduler_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending_hints: Mutex::new(Vec::new()),
            hint_tx,
        });
        (controller, hint_rx)
    }

    pub fn scheduler_lock(&self) -> FetchSchedulerLock {
        Arc::clone(&self.scheduler_lock)
    }
}

impl DownloadScheduler for DownloaderController {
    fn on_trust_changed(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
        old: FetchStatus,
        new: FetchStatus,
    ) -> Result<(), WotError> {
        if new.fast && !old.fast {
            batch.stage_command(DownloadCommand::start(identity.id));
        } else if old.fast && !new.fast {
            batch.stage_command(DownloadCommand::stop(identity.id));
        }
        Ok(())
    }

    fn on_identity_created(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
        status: FetchStatus,
    ) -> Result<(), WotError> {
        // Own identities are fetched only while restoring; that path goes
        // through `on_own_identity_restored_post`.
        if status.fast && !identity.is_own() {
            batch.stage_command(DownloadCommand::start(identity.id));
        }
        Ok(())
    }

    fn on_own_identity_deleted_pre(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError> {
        batch.stage_command(DownloadCommand::stop(identity.id));
        Ok(())
    }

    fn on_own_identity_deleted_post(
        &self,
        _batch: &mut WriteBatch,
        _identity: &Identity,
    ) -> Result<(), WotError> {
        Ok(())
    }

    fn on_own_identity_restored_pre(
        &self,
        _batch: &mut WriteBatch,
        _identity: &Identity,
    ) -> Result<(), WotError> {
        Ok(())
    }

    fn on_own_identity_restored_post(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError> {
        // Restoring means downloading our own historical editions.
        batch.stage_command(DownloadCommand::start(identity.id));
        Ok(())
    }

    fn on_edition_hint(&self, hint: &EditionHint) {
        if hint.source_capacity == 0 {
            return;
        }
        self.pending_hints
            .lock()
            .expect("hint buffer lock poisoned")
            .push(*hint);
    }

    fn after_commit(&self) {
        let hints: Vec<EditionHint> = self
            .pending_hints
            .lock()
            .expect("hint buffer lock poisoned")
            .drain(..)
            .collect();
        for hint in hints {
            debug!(target = %hint.target, edition = hint.edition, "edition hint released");
            // A closed receiver only means the slow downloader is gone.
            let _ = self.hint_tx.send(hint);
        }
    }

    fn after_rollback(&self) {
        self.pending_hints
            .lock()
            .expect("hint buffer lock poisoned")
            .clear();
    }
}
