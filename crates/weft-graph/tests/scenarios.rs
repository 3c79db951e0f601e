//! End-to-end scenarios for the score engine.
//!
//! Every engine here runs with `debug_incremental_scores` on, so each
//! incremental mutation is checked against the from-scratch reference as a
//! side effect of the scenario itself.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use weft_core::clock::ManualClock;
use weft_core::error::WotError;
use weft_core::identity::{FetchState, Identity};
use weft_core::types::IdentityId;
use weft_core::uri::RequestUri;
use weft_crypto::IdentityKeypair;
use weft_graph::callbacks::{DownloadScheduler, EditionHint, FetchStatus};
use weft_graph::events::SubscriptionManager;
use weft_graph::ScoreEngine;
use weft_store::{DownloadCommand, GraphDb, WriteBatch};
use weft_xml::{IdentityFile, TrustListEntry};

// ── Recording scheduler ───────────────────────────────────────────────────────

/// Stages start/stop commands like the real controller and records every
/// callback for assertions.
#[derive(Default)]
struct RecordingScheduler {
    hints: Mutex<Vec<EditionHint>>,
    committed_hints: Mutex<Vec<EditionHint>>,
    transitions: Mutex<Vec<(IdentityId, FetchStatus, FetchStatus)>>,
}

impl DownloadScheduler for RecordingScheduler {
    fn on_trust_changed(
        &self,
        batch: &mut WriteBatch,
        identity: &Identity,
        old: FetchStatus,
        new: FetchStatus,
    ) -> Result<(), WotError> {
        self.transitions
            .lock()
            .unwrap()
            .push((identity.id, old, new));
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
        if status.fast && !identity.is_own() {
            batch.stage_command(DownloadCommand::start(identity.id));
        }
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
        batch: &mut WriteBatch,
        identity: &Identity,
    ) -> Result<(), WotError> {
        batch.stage_command(DownloadCommand::start(identity.id));
        Ok(())
    }

    fn on_edition_hint(&self, hint: &EditionHint) {
        self.hints.lock().unwrap().push(*hint);
    }

    fn after_commit(&self) {
        let mut buffered = self.hints.lock().unwrap();
        self.committed_hints
            .lock()
            .unwrap()
            .extend(buffered.drain(..));
    }

    fn after_rollback(&self) {
        self.hints.lock().unwrap().clear();
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    engine: ScoreEngine,
    db: Arc<GraphDb>,
    scheduler: Arc<RecordingScheduler>,
    #[allow(dead_code)]
    clock: ManualClock,
}

fn harness(tag: &str) -> Harness {
    let path = std::env::temp_dir().join(format!("weft_graph_{}_{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    let db = Arc::new(GraphDb::open(&path).unwrap());
    let clock = ManualClock::at(1_700_000_000);
    let scheduler = Arc::new(RecordingScheduler::default());
    let engine = ScoreEngine::new(
        Arc::clone(&db),
        Arc::new(clock.clone()),
        scheduler.clone(),
        Arc::new(SubscriptionManager::new()),
        true,
    );
    Harness {
        engine,
        db,
        scheduler,
        clock,
    }
}

fn uri(b: u8, edition: u64) -> RequestUri {
    RequestUri {
        routing_key: [b; 32],
        crypto_key: [b.wrapping_add(100); 32],
        settings: "AQACAAE".into(),
        edition,
    }
}

fn file(nickname: &str, trusts: &[(RequestUri, i8)]) -> IdentityFile {
    IdentityFile {
        nickname: nickname.into(),
        publishes_trust_list: true,
        contexts: vec![],
        properties: BTreeMap::new(),
        trust_list: trusts
            .iter()
            .map(|(uri, value)| TrustListEntry {
                trustee_uri: uri.clone(),
                value: *value,
                comment: String::new(),
            })
            .collect(),
    }
}

fn import(engine: &mut ScoreEngine, truster: &IdentityId, edition: u64, f: &IdentityFile) {
    engine.begin_trust_list_import().unwrap();
    engine.import_trust_list(truster, edition, f).unwrap();
    engine.finish_trust_list_import().unwrap();
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn self_score_on_own_identity_creation() {
    let mut h = harness("self_score");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let score = h.engine.score(&o1.id, &o1.id).unwrap();
    assert_eq!((score.value, score.rank, score.capacity), (i32::MAX, 0, 100));
    assert!(h.engine.should_fetch_identity(&o1.id).unwrap());
    assert!(h.engine.trusts_of(&o1.id).unwrap().is_empty());
    assert_eq!(h.db.count_scores(), 1);
}

#[test]
fn simple_chain_attenuates_by_rank() {
    let mut h = harness("chain");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "friend").unwrap();
    import(&mut h.engine, &a, 1, &file("alice", &[(uri(2, 7), 100)]));
    let b = uri(2, 7).derived_id();

    let sa = h.engine.score(&o1.id, &a).unwrap();
    assert_eq!((sa.value, sa.rank, sa.capacity), (100, 1, 40));
    let sb = h.engine.score(&o1.id, &b).unwrap();
    assert_eq!((sb.value, sb.rank, sb.capacity), (40, 2, 16));

    assert!(h.engine.should_fetch_identity(&a).unwrap());
    assert!(h.engine.should_fetch_identity(&b).unwrap());

    // A's appearance staged a fast-path start; B reached the slow path via
    // the edition hint from alice's list.
    let drained = h.db.take_commands().unwrap();
    assert!(drained.contains(&DownloadCommand::start(a)));
    let hints = h.scheduler.committed_hints.lock().unwrap();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].target, b);
    assert_eq!(hints[0].edition, 7);
    assert_eq!(hints[0].source_capacity, 40);
}

#[test]
fn direct_distrust_overrides_and_prunes() {
    let mut h = harness("distrust");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();
    import(&mut h.engine, &a, 1, &file("alice", &[(uri(2, 0), 100)]));
    let b = uri(2, 0).derived_id();
    import(&mut h.engine, &b, 1, &file("bob", &[(uri(3, 0), 100)]));
    let c = uri(3, 0).derived_id();
    assert!(h.engine.score(&o1.id, &c).is_ok());

    // Explicit distrust wins over the positive 2-hop path.
    h.engine.set_trust(&o1.id, &b, -1, "spammer").unwrap();

    let sb = h.engine.score(&o1.id, &b).unwrap();
    assert!(sb.value < 0);
    assert_eq!((sb.rank, sb.capacity), (1, 0));
    assert!(!h.engine.should_fetch_identity(&b).unwrap());

    // B's capacity 0 prunes its subtree: C loses its score and, having no
    // other referrer, disappears entirely.
    assert!(matches!(
        h.engine.score(&o1.id, &c),
        Err(WotError::NotInTrustTree { .. })
    ));
    assert!(h.engine.identity(&c).is_err());
}

#[test]
fn newer_edition_supersedes_trust_list() {
    let mut h = harness("supersede");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();
    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();

    import(
        &mut h.engine,
        &a,
        5,
        &file("alice", &[(uri(2, 0), 100), (uri(3, 0), 50)]),
    );
    let b = uri(2, 0).derived_id();
    let c = uri(3, 0).derived_id();
    assert!(h.engine.score(&o1.id, &c).is_ok());

    import(&mut h.engine, &a, 7, &file("alice", &[(uri(2, 0), 100)]));

    assert!(h.engine.score(&o1.id, &b).is_ok());
    assert!(h.engine.score(&o1.id, &c).is_err(), "A→C edge removed");
    assert!(h.engine.identity(&c).is_err(), "C unreferenced, collected");
    assert_eq!(h.engine.trusts_of(&a).unwrap().len(), 1);
    assert_eq!(h.engine.identity(&a).unwrap().request_uri.edition, 7);
}

#[test]
fn stale_and_repeated_editions_are_discarded() {
    let mut h = harness("stale");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();
    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();

    import(&mut h.engine, &a, 5, &file("alice", &[(uri(2, 0), 100)]));
    let scores_after_first: Vec<_> = h.db.iter_scores().unwrap();

    // Same edition again: no-op. Lower edition: no-op.
    import(&mut h.engine, &a, 5, &file("alice", &[(uri(3, 0), 100)]));
    import(&mut h.engine, &a, 3, &file("alice", &[(uri(4, 0), 100)]));

    assert_eq!(h.db.iter_scores().unwrap(), scores_after_first);
    assert_eq!(h.engine.trusts_of(&a).unwrap().len(), 1);
}

#[test]
fn introduction_grants_zero_trust_and_capacity() {
    let mut h = harness("introduction");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let x = h.engine.add_introduction(&o1.id, &uri(9, 0)).unwrap();

    let trust = &h.engine.trusts_of(&o1.id).unwrap()[0];
    assert_eq!((trust.trustee, trust.value), (x, 0));

    let sx = h.engine.score(&o1.id, &x).unwrap();
    assert_eq!((sx.value, sx.rank, sx.capacity), (0, 1, 40));
    assert!(
        sx.capacity > 0,
        "solver can now introduce further identities"
    );
    assert!(h.engine.should_fetch_identity(&x).unwrap());
}

#[test]
fn refetch_on_rank_flip() {
    let mut h = harness("refetch");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 10, "").unwrap();
    import(&mut h.engine, &a, 3, &file("alice", &[]));
    assert_eq!(h.engine.identity(&a).unwrap().fetch_state, FetchState::Fetched);

    h.engine.set_trust(&o1.id, &a, -50, "").unwrap();
    assert!(!h.engine.should_fetch_identity(&a).unwrap());
    let _ = h.db.take_commands().unwrap();

    // Crossing back over 0 forces a refetch from one edition earlier.
    h.engine.set_trust(&o1.id, &a, 50, "").unwrap();
    let a_identity = h.engine.identity(&a).unwrap();
    assert_eq!(a_identity.fetch_state, FetchState::NotFetched);
    assert_eq!(a_identity.request_uri.edition, 2);
    assert_eq!(
        h.db.take_commands().unwrap(),
        vec![DownloadCommand::start(a)]
    );
}

#[test]
fn removing_last_edge_collects_the_subtree() {
    let mut h = harness("gc");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();

    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();
    import(&mut h.engine, &a, 1, &file("alice", &[(uri(2, 0), 100)]));

    h.engine.remove_trust(&o1.id, &a).unwrap();

    // Only the own identity and its self-score survive.
    assert_eq!(h.db.count_identities(), 1);
    assert_eq!(h.db.count_trusts(), 0);
    assert_eq!(h.db.count_scores(), 1);
    assert!(h.engine.score(&o1.id, &o1.id).is_ok());
}

#[test]
fn aborted_import_leaves_no_trace() {
    let mut h = harness("abort");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();
    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();

    h.engine.begin_trust_list_import().unwrap();
    h.engine
        .import_trust_list(&a, 1, &file("alice", &[(uri(2, 0), 100)]))
        .unwrap();
    h.engine.abort_trust_list_import();

    assert!(h.engine.identity(&uri(2, 0).derived_id()).is_err());
    assert_eq!(h.engine.identity(&a).unwrap().request_uri.edition, 0);
    assert_eq!(h.db.count_trusts(), 1);
}

#[test]
fn batched_import_matches_from_scratch() {
    let mut h = harness("batched");
    let kp = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp, "o1", true).unwrap();
    let a = h.engine.set_trust_by_uri(&o1.id, &uri(1, 0), 100, "").unwrap();
    let b = h.engine.set_trust_by_uri(&o1.id, &uri(2, 0), 80, "").unwrap();

    // Two lists in one batched import scope.
    h.engine.begin_trust_list_import().unwrap();
    h.engine
        .import_trust_list(&a, 1, &file("alice", &[(uri(3, 0), 100), (uri(4, 0), -100)]))
        .unwrap();
    h.engine
        .import_trust_list(&b, 1, &file("bob", &[(uri(3, 0), 50)]))
        .unwrap();
    h.engine.finish_trust_list_import().unwrap();

    let c = uri(3, 0).derived_id();
    let sc = h.engine.score(&o1.id, &c).unwrap();
    // 40×100/100 from A plus 40×50/100 from B.
    assert_eq!(sc.value, 60);
    assert_eq!(sc.rank, 2);

    // The hostile-only target exists with the sentinel rank and no
    // download eligibility.
    let d = uri(4, 0).derived_id();
    let sd = h.engine.score(&o1.id, &d).unwrap();
    assert_eq!(sd.capacity, 0);
    assert_eq!(sd.rank, u32::MAX);
    assert!(!h.engine.should_fetch_identity(&d).unwrap());

    // Re-running the reference recomputation changes nothing.
    assert_eq!(h.engine.compute_all_scores_from_scratch().unwrap(), 0);
}

#[test]
fn delete_own_identity_drops_tree_and_reschedules_defrag() {
    let mut h = harness("delete_own");
    let kp1 = IdentityKeypair::generate();
    let kp2 = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp1, "o1", true).unwrap();
    let o2 = h.engine.create_own_identity(&kp2, "o2", true).unwrap();

    // O1 distrusts O2: O2 survives deletion (direct opinion pins it), but
    // contributes nothing to O1's tree, so A lives only in O2's own tree.
    h.engine.set_trust(&o1.id, &o2.id, -5, "").unwrap();
    let a = h.engine.set_trust_by_uri(&o2.id, &uri(1, 0), 100, "").unwrap();

    let mut config = h.db.configuration().unwrap();
    config.last_defrag = Some(123);
    h.db.put_configuration(&config).unwrap();

    h.engine.delete_own_identity(&o2.id).unwrap();

    let o2_identity = h.engine.identity(&o2.id).unwrap();
    assert!(!o2_identity.is_own());
    assert!(h.engine.score(&o2.id, &a).is_err(), "tree removed");
    // A was only reachable through O2's tree.
    assert!(h.engine.identity(&a).is_err());
    // O1's view of O2 is intact.
    assert!(h.engine.score(&o1.id, &o2.id).is_ok());
    assert_eq!(
        h.db.configuration().unwrap().last_defrag,
        None,
        "defragmentation re-scheduled after own-identity deletion"
    );
}

#[test]
fn restore_own_identity_enters_restore_mode() {
    let mut h = harness("restore");
    let kp1 = IdentityKeypair::generate();
    let kp2 = IdentityKeypair::generate();
    let o1 = h.engine.create_own_identity(&kp1, "o1", true).unwrap();

    // O2 exists, gets deleted, then is restored from its keypair.
    let o2 = h.engine.create_own_identity(&kp2, "o2", true).unwrap();
    h.engine.set_trust(&o1.id, &o2.id, 30, "").unwrap();
    h.engine.delete_own_identity(&o2.id).unwrap();
    let _ = h.db.take_commands().unwrap();

    let restored = h.engine.restore_own_identity(&kp2).unwrap();
    assert!(restored.is_own());
    assert!(restored.in_restore());
    assert_eq!(restored.fetch_state, FetchState::NotFetched);
    let score = h.engine.score(&restored.id, &restored.id).unwrap();
    assert_eq!((score.value, score.rank, score.capacity), (i32::MAX, 0, 100));
    assert!(
        h.db.take_commands()
            .unwrap()
            .contains(&DownloadCommand::start(restored.id)),
        "restore subscribes the own identity on the fast path"
    );

    h.engine.startup_integrity_test().unwrap();
}

#[test]
fn startup_integrity_test_detects_dangling_trust() {
    let h = harness("integrity");
    // Forge a trust edge whose endpoints do not exist.
    let mut batch = WriteBatch::new(Arc::clone(&h.db));
    batch.put_trust(
        weft_core::trust::Trust::new(
            uri(1, 0).derived_id(),
            uri(2, 0).derived_id(),
            10,
            "",
            0,
        )
        .unwrap(),
    );
    batch.commit().unwrap();

    let engine = &h.engine;
    assert!(matches!(
        engine.startup_integrity_test(),
        Err(WotError::Corruption(_))
    ));
}
