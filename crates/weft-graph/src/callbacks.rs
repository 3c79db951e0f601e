//! Downloader callback surface.
//!
//! The engine invokes these inside the graph transaction, which may still
//! roll back. Implementations must therefore confine their effects to the
//! transaction itself — staging download-command rows on the batch — and
//! defer anything external (edition hints for the slow downloader) until
//! [`DownloadScheduler::after_commit`].

use std::cmp::Ordering;

use weft_core::error::WotError;
use weft_core::identity::Identity;
use weft_core::types::{Edition, IdentityId, Timestamp};
use weft_store::WriteBatch;

/// Download-relevant summary of an identity's scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchStatus {
    /// Some score has value ≥ 0 or capacity > 0.
    pub should_fetch: bool,
    /// On the fast path: locally owned, or rank ≤ 1 in some tree with a
    /// fetch-eligible score.
    pub fast: bool,
}

impl FetchStatus {
    pub const NONE: FetchStatus = FetchStatus {
        should_fetch: false,
        fast: false,
    };
}

/// An edition claim about a third identity, carried inside a trust list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EditionHint {
    pub source: IdentityId,
    pub target: IdentityId,
    pub edition: Edition,
    /// Best capacity of the source across all own trees at observation time.
    pub source_capacity: u8,
    /// Best score value of the source across all own trees.
    pub source_score: i32,
    pub date: Timestamp,
}

impl Ord for EditionHint {
    /// Download priority: newer hints first, then more-trusted sources,
    /// then higher editions; target id last for determinism.
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then(self.source_capacity.cmp(&other.source_capacity))
            .then(self.source_score.cmp(&other.source_score))
            .then(self.edition.cmp(&other.edition))
            .then_with(|| other.target.cmp(&self.target))
    }
}

impl PartialOrd for EditionHint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implemented by the downloader controller. All `batch`-taking callbacks
/// run inside the engine transaction; `on_edition_hint` must only buffer.
pub trait DownloadScheduler: Send + Sync {
    /// The identity's fetch status changed as a result of trust mutation.
    fn on_trust_changed(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
        old: FetchStatus,
        new: FetchStatus,
    ) -> Result<(), WotError>;

    /// A previously unknown identity entered the graph.
    fn on_identity_created(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
        status: FetchStatus,
    ) -> Result<(), WotError>;

    fn on_own_identity_deleted_pre(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError>;

    fn on_own_identity_deleted_post(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError>;

    fn on_own_identity_restored_pre(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError>;

    fn on_own_identity_restored_post(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError>;

    /// A trust list claimed `hint.edition` exists for `hint.target`.
    fn on_edition_hint(&self, hint: &EditionHint);

    /// The transaction committed; buffered hints may now flow.
    fn after_commit(&self);

    /// The transaction rolled back; buffered hints must be dropped.
    fn after_rollback(&self);
}

/// Scheduler that ignores everything. Used by the CLI and by tests that
/// only exercise the graph.
pub struct NullScheduler;

impl DownloadScheduler for NullScheduler {
    fn on_trust_changed(
        &self,
        _batch: &mut WriteBatch,
        _identity: &Identity,
        _old: FetchStatus,
        _new: FetchStatus,
    ) -> Result<(), WotError> {
        Ok(())
    }

    fn on_identity_created(
        &self,
        _batch: &mut WriteBatch,
        _identity: &Identity,
        _status: FetchStatus,
    ) -> Result<(), WotError> {
        Ok(())
    }

    fn on_own_identity_deleted_pre(
        &self,
        _batch: &mut WriteBatch,
        _identity: &Identity,
    ) -> Result<(), WotError> {
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
        _batch: &mut WriteBatch,
        _identity: &Identity,
    ) -> Result<(), WotError> {
        Ok(())
    }

    fn on_edition_hint(&self, _hint: &EditionHint) {}

    fn after_commit(&self) {}

    fn after_rollback(&self) {}
}
