//! The trust-graph engine: the single writer over the graph store.
//!
//! Every public operation runs as one transaction: validate → stage on a
//! [`WriteBatch`] → recompute affected scores → commit. Change
//! notifications publish after commit; downloader callbacks fire inside the
//! transaction but only stage command rows, so a rollback leaves no trace.
//!
//! Trust-list imports are batched: between `begin_trust_list_import` and
//! `finish_trust_list_import` any number of lists can be applied while
//! score recomputation is deferred, so each affected subtree is propagated
//! at most once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use weft_core::clock::Clock;
use weft_core::error::WotError;
use weft_core::identity::{FetchState, Identity, OwnIdentityData};
use weft_core::score::Score;
use weft_core::trust::Trust;
use weft_core::types::{Edition, IdentityId, ScoreId, TrustId, TrustValue};
use weft_core::uri::RequestUri;
use weft_crypto::IdentityKeypair;
use weft_store::{GraphDb, WriteBatch};
use weft_xml::IdentityFile;

use crate::callbacks::{DownloadScheduler, EditionHint, FetchStatus};
use crate::events::{ChangeDomain, SubscriptionManager};
use crate::recompute;

// ── ScoreEngine ──────────────────────────────────────────────────────────────

pub struct ScoreEngine {
    db: Arc<GraphDb>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn DownloadScheduler>,
    events: Arc<SubscriptionManager>,
    /// Assert incremental results against the from-scratch reference after
    /// every mutation. Expensive; for debugging only.
    debug_incremental_scores: bool,
    import: Option<ImportSession>,
}

/// Deferred-recomputation state of an open trust-list import.
struct ImportSession {
    batch: WriteBatch,
    /// Trustees whose rank structure may have changed.
    structural: BTreeSet<IdentityId>,
    /// Trustees needing only a value refresh.
    value_only: BTreeSet<IdentityId>,
    /// Identities first seen during this import.
    created: BTreeSet<IdentityId>,
}

impl ScoreEngine {
    pub fn new(
        db: Arc<GraphDb>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn DownloadScheduler>,
        events: Arc<SubscriptionManager>,
        debug_incremental_scores: bool,
    ) -> Self {
        Self {
            db,
            clock,
            scheduler,
            events,
            debug_incremental_scores,
            import: None,
        }
    }

    pub fn db(&self) -> &Arc<GraphDb> {
        &self.db
    }

    pub fn events(&self) -> &Arc<SubscriptionManager> {
        &self.events
    }

    // ── Read access ──────────────────────────────────────────────────────────

    pub fn identity(&self, id: &IdentityId) -> Result<Identity, WotError> {
        self.db
            .get_identity(id)?
            .ok_or_else(|| WotError::UnknownIdentity(id.to_string()))
    }

    pub fn own_identities(&self) -> Result<Vec<Identity>, WotError> {
        self.db.own_identities()
    }

    pub fn trusts_of(&self, truster: &IdentityId) -> Result<Vec<Trust>, WotError> {
        self.db.trusts_by_truster(truster)
    }

    pub fn score(&self, owner: &IdentityId, target: &IdentityId) -> Result<Score, WotError> {
        self.db
            .get_score(&ScoreId::new(*owner, *target))?
            .ok_or_else(|| WotError::NotInTrustTree {
                owner: owner.to_string(),
                target: target.to_string(),
            })
    }

    /// Download policy: some tree holds a score with value ≥ 0 or
    /// capacity > 0.
    pub fn should_fetch_identity(&self, id: &IdentityId) -> Result<bool, WotError> {
        Ok(self
            .db
            .scores_of_target(id)?
            .iter()
            .any(Score::should_maybe_fetch))
    }

    // ── Own identity lifecycle ───────────────────────────────────────────────

    pub fn create_own_identity(
        &mut self,
        keypair: &IdentityKeypair,
        nickname: &str,
        publishes_trust_list: bool,
    ) -> Result<Identity, WotError> {
        self.mutate(|engine, batch| {
            let id = keypair.identity_id();
            if batch.get_identity(&id)?.is_some() {
                return Err(WotError::IdentityExists(id.to_string()));
            }
            let identity = Identity::new_own(
                keypair.request_uri(0),
                keypair.insert_uri(0),
                nickname,
                publishes_trust_list,
                engine.clock.now(),
            )?;
            batch.put_identity(identity.clone());
            engine.events.stage(ChangeDomain::Identity, id.to_string());

            let score = Score::own_self_score(id);
            batch.put_score(score);
            engine.events.stage(ChangeDomain::Score, score.id().to_string());

            engine.scheduler.on_identity_created(
                batch,
                &identity,
                FetchStatus {
                    should_fetch: true,
                    fast: true,
                },
            )?;
            info!(identity = %id, nickname, "own identity created");
            Ok(identity)
        })
    }

    /// Demote an own identity to a plain remote identity, keeping its id
    /// and adjacent trusts, and drop its whole score tree.
    pub fn delete_own_identity(&mut self, id: &IdentityId) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let mut identity = batch
                .get_identity(id)?
                .ok_or_else(|| WotError::UnknownIdentity(id.to_string()))?;
            if !identity.is_own() {
                return Err(WotError::NotOwnIdentity(id.to_string()));
            }
            engine.scheduler.on_own_identity_deleted_pre(batch, &identity)?;

            identity.own = None;
            identity.last_changed = engine.clock.now();
            batch.put_identity(identity.clone());
            engine.events.stage(ChangeDomain::Identity, id.to_string());

            let mut removed = BTreeSet::new();
            removed.insert(*id);
            engine.finalize(
                batch,
                &BTreeSet::new(),
                &BTreeSet::new(),
                &BTreeSet::new(),
                true,
                &removed,
            )?;

            // Residual private data must be overwritten on disk.
            let mut config = batch.configuration()?;
            config.last_defrag = None;
            batch.set_configuration(config);

            let post = batch.get_identity(id)?;
            engine
                .scheduler
                .on_own_identity_deleted_post(batch, post.as_ref().unwrap_or(&identity))?;
            info!(identity = %id, "own identity deleted");
            Ok(())
        })
    }

    /// Promote a known identity (or register a fresh one) as locally owned,
    /// in restore: its fetch state goes to `NotFetched` so the downloaders
    /// rebuild its published state from the network.
    pub fn restore_own_identity(
        &mut self,
        keypair: &IdentityKeypair,
    ) -> Result<Identity, WotError> {
        self.mutate(|engine, batch| {
            let id = keypair.identity_id();
            let now = engine.clock.now();
            let existing = batch.get_identity(&id)?;
            if existing.as_ref().is_some_and(Identity::is_own) {
                return Err(WotError::IdentityExists(id.to_string()));
            }

            let identity = match existing {
                Some(mut remote) => {
                    engine.scheduler.on_own_identity_restored_pre(batch, &remote)?;
                    remote.own = Some(OwnIdentityData {
                        insert_uri: keypair.insert_uri(remote.request_uri.edition),
                        last_insert: None,
                    });
                    remote.fetch_state = FetchState::NotFetched;
                    remote.last_changed = now;
                    remote
                }
                None => {
                    let mut fresh = Identity::new_remote(keypair.request_uri(0), now);
                    engine.scheduler.on_own_identity_restored_pre(batch, &fresh)?;
                    fresh.own = Some(OwnIdentityData {
                        insert_uri: keypair.insert_uri(0),
                        last_insert: None,
                    });
                    fresh
                }
            };
            batch.put_identity(identity.clone());
            engine.events.stage(ChangeDomain::Identity, id.to_string());

            engine.finalize(
                batch,
                &BTreeSet::new(),
                &BTreeSet::new(),
                &BTreeSet::new(),
                true,
                &BTreeSet::new(),
            )?;

            let identity = batch
                .get_identity(&id)?
                .ok_or_else(|| WotError::Corruption(format!("restored identity {id} vanished")))?;
            engine
                .scheduler
                .on_own_identity_restored_post(batch, &identity)?;
            info!(identity = %id, "own identity restored");
            Ok(identity)
        })
    }

    // ── Trust mutation ───────────────────────────────────────────────────────

    pub fn set_trust(
        &mut self,
        owner: &IdentityId,
        trustee: &IdentityId,
        value: TrustValue,
        comment: &str,
    ) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let owner_identity = batch
                .get_identity(owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            if !owner_identity.is_own() {
                return Err(WotError::NotOwnIdentity(owner.to_string()));
            }
            if batch.get_identity(trustee)?.is_none() {
                return Err(WotError::UnknownIdentity(trustee.to_string()));
            }
            let (structural, value_only) =
                engine.stage_trust_edge(batch, &owner_identity, trustee, value, comment)?;
            engine.finalize(
                batch,
                &structural,
                &value_only,
                &BTreeSet::new(),
                false,
                &BTreeSet::new(),
            )?;
            info!(truster = %owner, trustee = %trustee, value, "trust set");
            Ok(())
        })
    }

    /// Assign trust to an identity known only by request URI, registering
    /// it first when necessary.
    pub fn set_trust_by_uri(
        &mut self,
        owner: &IdentityId,
        trustee_uri: &RequestUri,
        value: TrustValue,
        comment: &str,
    ) -> Result<IdentityId, WotError> {
        self.mutate(|engine, batch| {
            let owner_identity = batch
                .get_identity(owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            if !owner_identity.is_own() {
                return Err(WotError::NotOwnIdentity(owner.to_string()));
            }
            let trustee = trustee_uri.derived_id();
            if trustee == *owner {
                return Err(WotError::SelfTrust);
            }

            let mut created = BTreeSet::new();
            if batch.get_identity(&trustee)?.is_none() {
                let fresh = Identity::new_remote(trustee_uri.clone(), engine.clock.now());
                batch.put_identity(fresh);
                engine.events.stage(ChangeDomain::Identity, trustee.to_string());
                created.insert(trustee);
            }

            let (structural, value_only) =
                engine.stage_trust_edge(batch, &owner_identity, &trustee, value, comment)?;
            engine.finalize(batch, &structural, &value_only, &created, false, &BTreeSet::new())?;
            info!(truster = %owner, trustee = %trustee, value, "trust set");
            Ok(trustee)
        })
    }

    pub fn remove_trust(
        &mut self,
        owner: &IdentityId,
        trustee: &IdentityId,
    ) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let owner_identity = batch
                .get_identity(owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            if !owner_identity.is_own() {
                return Err(WotError::NotOwnIdentity(owner.to_string()));
            }
            let trust_id = TrustId::new(*owner, *trustee);
            if batch.get_trust(&trust_id)?.is_none() {
                return Err(WotError::NotTrusted {
                    truster: owner.to_string(),
                    trustee: trustee.to_string(),
                });
            }
            batch.delete_trust(&trust_id);
            engine.events.stage(ChangeDomain::Trust, trust_id.to_string());

            let mut structural = BTreeSet::new();
            structural.insert(*trustee);
            engine.finalize(
                batch,
                &structural,
                &BTreeSet::new(),
                &BTreeSet::new(),
                false,
                &BTreeSet::new(),
            )?;
            info!(truster = %owner, trustee = %trustee, "trust removed");
            Ok(())
        })
    }

    /// Accept a solved introduction puzzle: register the solver if unknown
    /// and answer with a zero-value trust edge, which ranks the solver and
    /// makes it visible to the downloaders.
    pub fn add_introduction(
        &mut self,
        owner: &IdentityId,
        solver_uri: &RequestUri,
    ) -> Result<IdentityId, WotError> {
        self.mutate(|engine, batch| {
            let owner_identity = batch
                .get_identity(owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            if !owner_identity.is_own() {
                return Err(WotError::NotOwnIdentity(owner.to_string()));
            }
            let solver = solver_uri.derived_id();
            if solver == *owner {
                return Err(WotError::SelfTrust);
            }

            let mut created = BTreeSet::new();
            if batch.get_identity(&solver)?.is_none() {
                let fresh = Identity::new_remote(solver_uri.clone(), engine.clock.now());
                batch.put_identity(fresh);
                engine.events.stage(ChangeDomain::Identity, solver.to_string());
                created.insert(solver);
            }

            let (structural, value_only) =
                engine.stage_trust_edge(batch, &owner_identity, &solver, 0, "Puzzle introduction")?;
            engine.finalize(batch, &structural, &value_only, &created, false, &BTreeSet::new())?;
            info!(owner = %owner, solver = %solver, "introduction accepted");
            Ok(solver)
        })
    }

    /// Stage one edge from an own identity, classifying the change for the
    /// recomputation that follows.
    fn stage_trust_edge(
        &self,
        batch: &mut WriteBatch,
        owner_identity: &Identity,
        trustee: &IdentityId,
        value: TrustValue,
        comment: &str,
    ) -> Result<(BTreeSet<IdentityId>, BTreeSet<IdentityId>), WotError> {
        let trust = Trust::new(
            owner_identity.id,
            *trustee,
            value,
            comment,
            owner_identity.request_uri.edition,
        )?;
        let old = batch.get_trust(&trust.id())?;
        let changed = old
            .as_ref()
            .map_or(true, |o| o.value != trust.value || o.comment != trust.comment);
        batch.put_trust(trust.clone());
        if changed {
            self.events.stage(ChangeDomain::Trust, trust.id().to_string());
        }

        let mut structural = BTreeSet::new();
        let mut value_only = BTreeSet::new();
        match old {
            Some(old) if old.is_positive() == trust.is_positive() => {
                if old.value != trust.value {
                    value_only.insert(*trustee);
                }
            }
            _ => {
                structural.insert(*trustee);
            }
        }
        Ok((structural, value_only))
    }

    // ── Trust-list import ────────────────────────────────────────────────────

    pub fn begin_trust_list_import(&mut self) -> Result<(), WotError> {
        if self.import.is_some() {
            return Err(WotError::Other(
                "trust-list import already in progress".to_string(),
            ));
        }
        self.import = Some(ImportSession {
            batch: WriteBatch::new(Arc::clone(&self.db)),
            structural: BTreeSet::new(),
            value_only: BTreeSet::new(),
            created: BTreeSet::new(),
        });
        Ok(())
    }

    /// Replace `truster`'s outgoing edges with the given identity file's
    /// trust list, tagging each edge with `edition`. Editions below the
    /// already-processed one are discarded silently; an equal edition is
    /// reprocessed only after a parse failure.
    pub fn import_trust_list(
        &mut self,
        truster: &IdentityId,
        edition: Edition,
        file: &IdentityFile,
    ) -> Result<(), WotError> {
        let mut session = self
            .import
            .take()
            .ok_or_else(|| WotError::Other("no trust-list import in progress".to_string()))?;
        let result = self.import_into(&mut session, truster, edition, file);
        self.import = Some(session);
        result
    }

    pub fn finish_trust_list_import(&mut self) -> Result<(), WotError> {
        let mut session = self
            .import
            .take()
            .ok_or_else(|| WotError::Other("no trust-list import in progress".to_string()))?;
        let result = self.finalize(
            &mut session.batch,
            &session.structural,
            &session.value_only,
            &session.created,
            false,
            &BTreeSet::new(),
        );
        match result {
            Ok(_) => self.commit(session.batch),
            Err(e) => {
                drop(session.batch);
                self.rollback();
                Err(e)
            }
        }
    }

    pub fn abort_trust_list_import(&mut self) {
        if self.import.take().is_some() {
            self.rollback();
            warn!("trust-list import aborted");
        }
    }

    fn import_into(
        &self,
        session: &mut ImportSession,
        truster_id: &IdentityId,
        edition: Edition,
        file: &IdentityFile,
    ) -> Result<(), WotError> {
        let batch = &mut session.batch;
        let now = self.clock.now();
        let mut truster = batch
            .get_identity(truster_id)?
            .ok_or_else(|| WotError::UnknownIdentity(truster_id.to_string()))?;

        // Edition gating.
        let processed = truster.request_uri.edition;
        if edition < processed
            || (edition == processed && truster.fetch_state == FetchState::Fetched)
        {
            debug!(identity = %truster_id, edition, processed, "stale trust list discarded");
            return Ok(());
        }

        // Published attributes.
        truster.set_nickname(&file.nickname)?;
        truster.publishes_trust_list = file.publishes_trust_list;
        truster.contexts.clear();
        for context in &file.contexts {
            truster.add_context(context)?;
        }
        truster.properties.clear();
        for (key, value) in &file.properties {
            truster.set_property(key, value)?;
        }

        // Only capacity-bearing publishers introduce or retract edges.
        let may_publish_edges = truster.is_own()
            || batch
                .scores_of_target(truster_id)?
                .iter()
                .any(|s| s.capacity > 0);

        let old_edges: BTreeMap<IdentityId, Trust> = batch
            .trusts_by_truster(truster_id)?
            .into_iter()
            .map(|t| (t.trustee, t))
            .collect();
        let mut new_trustees: BTreeSet<IdentityId> = BTreeSet::new();

        if may_publish_edges {
            for entry in &file.trust_list {
                let trustee_id = entry.trustee_uri.derived_id();
                if trustee_id == *truster_id {
                    return Err(WotError::SelfTrust);
                }
                new_trustees.insert(trustee_id);

                let mut trustee = match batch.get_identity(&trustee_id)? {
                    Some(existing) => existing,
                    None => {
                        let fresh =
                            Identity::new_remote(entry.trustee_uri.with_edition(0), now);
                        batch.put_identity(fresh.clone());
                        self.events
                            .stage(ChangeDomain::Identity, trustee_id.to_string());
                        session.created.insert(trustee_id);
                        fresh
                    }
                };

                // The URI edition inside a trust list is an edition hint.
                if trustee.update_edition_hint(entry.trustee_uri.edition) {
                    batch.put_identity(trustee.clone());
                    self.events
                        .stage(ChangeDomain::Identity, trustee_id.to_string());
                    let (source_capacity, source_score) = best_standing(batch, truster_id)?;
                    self.scheduler.on_edition_hint(&EditionHint {
                        source: *truster_id,
                        target: trustee_id,
                        edition: entry.trustee_uri.edition,
                        source_capacity,
                        source_score,
                        date: now,
                    });
                }

                let trust =
                    Trust::new(*truster_id, trustee_id, entry.value, &entry.comment, edition)?;
                match old_edges.get(&trustee_id) {
                    Some(old) if old.value == trust.value && old.comment == trust.comment => {
                        // Unchanged opinion; refresh the edition tag only.
                        batch.put_trust(trust);
                    }
                    Some(old) => {
                        let sign_same = old.is_positive() == trust.is_positive();
                        batch.put_trust(trust.clone());
                        self.events.stage(ChangeDomain::Trust, trust.id().to_string());
                        if sign_same {
                            session.value_only.insert(trustee_id);
                        } else {
                            session.structural.insert(trustee_id);
                        }
                    }
                    None => {
                        batch.put_trust(trust.clone());
                        self.events.stage(ChangeDomain::Trust, trust.id().to_string());
                        session.structural.insert(trustee_id);
                    }
                }
            }

            // Edges absent from the new list are removals.
            for (trustee_id, old) in &old_edges {
                if !new_trustees.contains(trustee_id) && old.truster_edition < edition {
                    batch.delete_trust(&old.id());
                    self.events.stage(ChangeDomain::Trust, old.id().to_string());
                    session.structural.insert(*trustee_id);
                }
            }
        } else if !file.trust_list.is_empty() {
            debug!(identity = %truster_id, "trust list from zero-capacity publisher ignored");
        }

        truster.set_edition(edition);
        truster.fetch_state = FetchState::Fetched;
        truster.last_fetched = Some(now);
        truster.last_changed = now;
        batch.put_identity(truster);
        self.events.stage(ChangeDomain::Identity, truster_id.to_string());
        info!(identity = %truster_id, edition, trusts = file.trust_list.len(), "trust list imported");
        Ok(())
    }

    /// Record that the current edition of `id` could not be decoded. The
    /// edition still advances so the downloader does not retry in a loop.
    pub fn mark_parsing_failed(
        &mut self,
        id: &IdentityId,
        edition: Edition,
    ) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let mut identity = batch
                .get_identity(id)?
                .ok_or_else(|| WotError::UnknownIdentity(id.to_string()))?;
            if edition > identity.request_uri.edition {
                identity.set_edition(edition);
            }
            identity.fetch_state = FetchState::ParsingFailed;
            identity.last_fetched = Some(engine.clock.now());
            batch.put_identity(identity);
            engine.events.stage(ChangeDomain::Identity, id.to_string());
            warn!(identity = %id, edition, "identity file failed to parse");
            Ok(())
        })
    }

    // ── Full recomputation / verification ────────────────────────────────────

    /// Reference recomputation of every score by BFS from each own
    /// identity. Returns the number of score rows that had to change.
    pub fn compute_all_scores_from_scratch(&mut self) -> Result<usize, WotError> {
        self.mutate(|engine, batch| {
            engine.finalize(
                batch,
                &BTreeSet::new(),
                &BTreeSet::new(),
                &BTreeSet::new(),
                true,
                &BTreeSet::new(),
            )
        })
    }

    /// Periodic paranoia pass: recompute from scratch, correct divergent
    /// rows, and record the verification date.
    pub fn verify_and_correct_stored_scores(&mut self) -> Result<usize, WotError> {
        self.mutate(|engine, batch| {
            let corrections = engine.finalize(
                batch,
                &BTreeSet::new(),
                &BTreeSet::new(),
                &BTreeSet::new(),
                true,
                &BTreeSet::new(),
            )?;
            if corrections > 0 {
                warn!(corrections, "stored scores diverged and were corrected");
            }
            let mut config = batch.configuration()?;
            config.last_score_verification = Some(engine.clock.now());
            batch.set_configuration(config);
            Ok(corrections)
        })
    }

    /// Read-only structural checks run at startup, before any other
    /// subsystem touches the store. Failure is fatal.
    pub fn startup_integrity_test(&self) -> Result<(), WotError> {
        for identity in self.db.iter_identities()? {
            if identity.request_uri.derived_id() != identity.id {
                return Err(WotError::Corruption(format!(
                    "identity {} does not match its request URI",
                    identity.id
                )));
            }
            if identity.latest_edition_hint < identity.request_uri.edition {
                return Err(WotError::Corruption(format!(
                    "identity {} has edition hint below its edition",
                    identity.id
                )));
            }
        }
        for trust in self.db.iter_trusts()? {
            if trust.truster == trust.trustee {
                return Err(WotError::Corruption(format!("self-trust at {}", trust.id())));
            }
            let truster = self.db.get_identity(&trust.truster)?.ok_or_else(|| {
                WotError::Corruption(format!("trust {} has dangling truster", trust.id()))
            })?;
            if self.db.get_identity(&trust.trustee)?.is_none() {
                return Err(WotError::Corruption(format!(
                    "trust {} has dangling trustee",
                    trust.id()
                )));
            }
            if trust.truster_edition > truster.request_uri.edition {
                return Err(WotError::Corruption(format!(
                    "trust {} tagged beyond its truster's edition",
                    trust.id()
                )));
            }
        }
        for score in self.db.iter_scores()? {
            let owner = self.db.get_identity(&score.owner)?.ok_or_else(|| {
                WotError::Corruption(format!("score {} has dangling owner", score.id()))
            })?;
            if !owner.is_own() {
                return Err(WotError::Corruption(format!(
                    "score {} owned by a non-own identity",
                    score.id()
                )));
            }
            if self.db.get_identity(&score.target)?.is_none() {
                return Err(WotError::Corruption(format!(
                    "score {} has dangling target",
                    score.id()
                )));
            }
        }
        Ok(())
    }

    // ── Own-identity edits / inserter hooks ──────────────────────────────────

    pub fn add_own_context(&mut self, id: &IdentityId, name: &str) -> Result<(), WotError> {
        self.edit_own(id, |identity| identity.add_context(name))
    }

    pub fn set_own_property(
        &mut self,
        id: &IdentityId,
        key: &str,
        value: &str,
    ) -> Result<(), WotError> {
        self.edit_own(id, |identity| identity.set_property(key, value))
    }

    fn edit_own(
        &mut self,
        id: &IdentityId,
        edit: impl FnOnce(&mut Identity) -> Result<(), WotError>,
    ) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let mut identity = batch
                .get_identity(id)?
                .ok_or_else(|| WotError::UnknownIdentity(id.to_string()))?;
            if !identity.is_own() {
                return Err(WotError::NotOwnIdentity(id.to_string()));
            }
            edit(&mut identity)?;
            identity.last_changed = engine.clock.now();
            batch.put_identity(identity);
            engine.events.stage(ChangeDomain::Identity, id.to_string());
            Ok(())
        })
    }

    /// Record a successful insert: advance the edition and mark the
    /// identity fetched so the loopback fetch does not re-import our own
    /// data.
    pub fn record_insert(&mut self, id: &IdentityId, edition: Edition) -> Result<(), WotError> {
        self.mutate(|engine, batch| {
            let mut identity = batch
                .get_identity(id)?
                .ok_or_else(|| WotError::UnknownIdentity(id.to_string()))?;
            if !identity.is_own() {
                return Err(WotError::NotOwnIdentity(id.to_string()));
            }
            identity.set_edition(edition);
            identity.fetch_state = FetchState::Fetched;
            let now = engine.clock.now();
            if let Some(own) = &mut identity.own {
                own.last_insert = Some(now);
            }
            batch.put_identity(identity);
            engine.events.stage(ChangeDomain::Identity, id.to_string());
            info!(identity = %id, edition, "own identity inserted");
            Ok(())
        })
    }

    // ── Transaction plumbing ─────────────────────────────────────────────────

    fn mutate<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut WriteBatch) -> Result<T, WotError>,
    ) -> Result<T, WotError> {
        if self.import.is_some() {
            return Err(WotError::Other(
                "operation not allowed while a trust-list import is open".to_string(),
            ));
        }
        let mut batch = WriteBatch::new(Arc::clone(&self.db));
        match f(self, &mut batch) {
            Ok(value) => {
                self.commit(batch)?;
                Ok(value)
            }
            Err(e) => {
                drop(batch);
                self.rollback();
                Err(e)
            }
        }
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), WotError> {
        match batch.commit() {
            Ok(()) => {
                self.events.publish_pending();
                self.scheduler.after_commit();
                Ok(())
            }
            Err(e) => {
                self.events.discard_pending();
                self.scheduler.after_rollback();
                Err(e)
            }
        }
    }

    fn rollback(&self) {
        self.events.discard_pending();
        self.scheduler.after_rollback();
    }

    // ── Recomputation core ───────────────────────────────────────────────────

    /// Recompute scores for the staged graph state and apply the diff:
    /// score rows, garbage collection, fetch-status transitions, refetch
    /// marking, and downloader callbacks. Returns the number of score rows
    /// changed.
    fn finalize(
        &self,
        batch: &mut WriteBatch,
        structural: &BTreeSet<IdentityId>,
        value_only: &BTreeSet<IdentityId>,
        created: &BTreeSet<IdentityId>,
        full: bool,
        removed_owners: &BTreeSet<IdentityId>,
    ) -> Result<usize, WotError> {
        let owners: Vec<IdentityId> =
            batch.own_identities()?.iter().map(|i| i.id).collect();

        // Plan new scores per owner. A removed owner's plan is empty, which
        // turns into wholesale deletion of its tree.
        type Plan = (Option<BTreeSet<IdentityId>>, BTreeMap<IdentityId, Score>);
        let mut plans: BTreeMap<IdentityId, Plan> = BTreeMap::new();
        for owner in removed_owners {
            plans.insert(*owner, (None, BTreeMap::new()));
        }
        for owner in &owners {
            if full {
                plans.insert(*owner, (None, recompute::compute_tree(batch, owner)?));
            } else if !structural.is_empty() {
                let (region, scores) = recompute::compute_region(batch, owner, structural)?;
                plans.insert(*owner, (Some(region), scores));
            }
        }

        // Everything whose scores may change.
        let mut affected: BTreeSet<IdentityId> = BTreeSet::new();
        for (owner, (region, new_scores)) in &plans {
            match region {
                Some(region) => affected.extend(region.iter().copied()),
                None => {
                    affected.extend(new_scores.keys().copied());
                    for score in batch.scores_of_owner(owner)? {
                        affected.insert(score.target);
                    }
                }
            }
        }
        affected.extend(value_only.iter().copied());
        affected.extend(created.iter().copied());

        // Statuses before any score mutation; the identity snapshot is kept
        // so callbacks can still be fired for garbage-collected targets.
        let mut before: BTreeMap<IdentityId, (Option<Identity>, FetchStatus)> = BTreeMap::new();
        for id in &affected {
            before.insert(*id, (batch.get_identity(id)?, fetch_status(batch, id)?));
        }

        // Apply planned score diffs.
        let mut mutations = 0usize;
        for (owner, (region, new_scores)) in &plans {
            let old: BTreeMap<IdentityId, Score> = batch
                .scores_of_owner(owner)?
                .into_iter()
                .filter(|s| region.as_ref().is_none_or(|r| r.contains(&s.target)))
                .map(|s| (s.target, s))
                .collect();
            for target in old.keys().filter(|t| !new_scores.contains_key(t)) {
                let score_id = ScoreId::new(*owner, *target);
                batch.delete_score(&score_id);
                self.events.stage(ChangeDomain::Score, score_id.to_string());
                mutations += 1;
            }
            for (target, score) in new_scores {
                if old.get(target) != Some(score) {
                    batch.put_score(*score);
                    self.events.stage(ChangeDomain::Score, score.id().to_string());
                    mutations += 1;
                }
            }
        }

        // Value-only refreshes, per owner, outside any recomputed region.
        for target in value_only {
            for owner in &owners {
                let covered = plans.get(owner).is_some_and(|(region, _)| {
                    region.as_ref().is_none_or(|r| r.contains(target))
                });
                if covered {
                    continue;
                }
                if let Some(value) = recompute::recompute_value_only(batch, owner, target)? {
                    let score_id = ScoreId::new(*owner, *target);
                    if let Some(mut score) = batch.get_score(&score_id)? {
                        if score.value != value {
                            score.value = value;
                            batch.put_score(score);
                            self.events.stage(ChangeDomain::Score, score_id.to_string());
                            mutations += 1;
                        }
                    }
                }
            }
        }

        // Garbage collection: a non-own identity with no score in any tree
        // disappears together with its incident edges.
        for id in affected.iter() {
            let Some(identity) = batch.get_identity(id)? else {
                continue;
            };
            if identity.is_own() {
                continue;
            }
            if batch.scores_of_target(id)?.is_empty() {
                for trust in batch.trusts_by_truster(id)? {
                    batch.delete_trust(&trust.id());
                    self.events.stage(ChangeDomain::Trust, trust.id().to_string());
                }
                for trust in batch.trusts_by_trustee(id)? {
                    batch.delete_trust(&trust.id());
                    self.events.stage(ChangeDomain::Trust, trust.id().to_string());
                }
                batch.delete_identity(*id);
                self.events.stage(ChangeDomain::Identity, id.to_string());
                debug!(identity = %id, "unreferenced identity removed");
            }
        }

        // Fetch-status transitions and downloader callbacks.
        for (id, (pre_identity, old_status)) in &before {
            let post_identity = batch.get_identity(id)?;
            let new_status = match post_identity {
                Some(_) => fetch_status(batch, id)?,
                None => FetchStatus::NONE,
            };
            if *old_status == new_status && !created.contains(id) {
                continue;
            }

            // A score crossing into eligibility re-fetches the identity
            // from its current edition.
            if let Some(mut identity) = batch.get_identity(id)? {
                if !old_status.should_fetch
                    && new_status.should_fetch
                    && !identity.is_own()
                    && identity.mark_for_refetch()
                {
                    batch.put_identity(identity);
                    self.events.stage(ChangeDomain::Identity, id.to_string());
                }
            }

            let identity_for_cb = match batch.get_identity(id)? {
                Some(identity) => identity,
                None => match pre_identity {
                    Some(identity) => identity.clone(),
                    None => continue,
                },
            };
            if created.contains(id) {
                self.scheduler
                    .on_identity_created(batch, &identity_for_cb, new_status)?;
            } else {
                self.scheduler
                    .on_trust_changed(batch, &identity_for_cb, *old_status, new_status)?;
            }
        }

        // Paranoia: the incremental result must equal the reference.
        if self.debug_incremental_scores && !full {
            for owner in &owners {
                let reference = recompute::compute_tree(batch, owner)?;
                let actual: BTreeMap<IdentityId, Score> = batch
                    .scores_of_owner(owner)?
                    .into_iter()
                    .map(|s| (s.target, s))
                    .collect();
                if reference != actual {
                    return Err(WotError::Corruption(format!(
                        "incremental scores diverged from the reference in the tree of {owner}"
                    )));
                }
            }
        }

        Ok(mutations)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Download-relevant summary of an identity's current scores.
fn fetch_status(batch: &WriteBatch, id: &IdentityId) -> Result<FetchStatus, WotError> {
    let scores = batch.scores_of_target(id)?;
    let should_fetch = scores.iter().any(Score::should_maybe_fetch);
    let own = batch
        .get_identity(id)?
        .is_some_and(|identity| identity.is_own());
    let fast = own
        || scores
            .iter()
            .any(|s| s.rank <= 1 && s.should_maybe_fetch());
    Ok(FetchStatus {
        should_fetch: should_fetch || own,
        fast,
    })
}

/// Best capacity and score value of `id` across all own trees.
fn best_standing(batch: &WriteBatch, id: &IdentityId) -> Result<(u8, i32), WotError> {
    let scores = batch.scores_of_target(id)?;
    let capacity = scores.iter().map(|s| s.capacity).max().unwrap_or(0);
    let value = scores.iter().map(|s| s.value).max().unwrap_or(0);
    Ok((capacity, value))
}
