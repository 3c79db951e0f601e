//! Invariant checks over randomized mutation sequences.
//!
//! A seeded RNG drives a mixed workload of trust edits and trust-list
//! imports; the engine runs with `debug_incremental_scores` on, so every
//! incremental step is already checked against the from-scratch reference.
//! Afterwards the stored graph is audited directly:
//!
//!   - every score's capacity is the rank-table value, overridden to 0 by
//!     the hostile sentinel or direct owner distrust;
//!   - every score's value is the owner's direct opinion, or else the
//!     capacity-weighted sum of incoming edges;
//!   - every trust is tagged at or below its truster's edition;
//!   - fetch eligibility matches the stored scores;
//!   - only identities with a score row (or own identities) exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use weft_core::clock::ManualClock;
use weft_core::constants::MAX_RANK;
use weft_core::score::capacity_for_rank;
use weft_core::types::{IdentityId, TrustId};
use weft_core::uri::RequestUri;
use weft_crypto::IdentityKeypair;
use weft_graph::{NullScheduler, ScoreEngine, SubscriptionManager};
use weft_store::GraphDb;
use weft_xml::{IdentityFile, TrustListEntry};

fn uri(b: u8, edition: u64) -> RequestUri {
    RequestUri {
        routing_key: [b; 32],
        crypto_key: [b.wrapping_mul(7).wrapping_add(1); 32],
        settings: "AQACAAE".into(),
        edition,
    }
}

const TRUST_VALUES: &[i8] = &[-100, -50, -1, 0, 25, 75, 100];

#[test]
fn randomized_workload_preserves_all_invariants() {
    let path = std::env::temp_dir().join(format!("weft_invariants_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    let db = Arc::new(GraphDb::open(&path).unwrap());
    let mut engine = ScoreEngine::new(
        Arc::clone(&db),
        Arc::new(ManualClock::at(1_600_000_000)),
        Arc::new(NullScheduler),
        Arc::new(SubscriptionManager::new()),
        true, // every incremental step asserts against the reference
    );
    let mut rng = StdRng::seed_from_u64(0xB0A7);

    // Two tree owners, a pool of remote identities addressed by URI.
    let kp1 = IdentityKeypair::generate();
    let kp2 = IdentityKeypair::generate();
    let o1 = engine.create_own_identity(&kp1, "o1", true).unwrap().id;
    let o2 = engine.create_own_identity(&kp2, "o2", true).unwrap().id;
    let owners = [o1, o2];

    let pool: Vec<RequestUri> = (1u8..=12).map(|b| uri(b, 0)).collect();
    let mut next_edition: BTreeMap<IdentityId, u64> = BTreeMap::new();

    for round in 0..60 {
        match rng.gen_range(0..4) {
            // Own-identity trust edit.
            0 => {
                let owner = *owners.choose(&mut rng).unwrap();
                let target = pool.choose(&mut rng).unwrap();
                let value = *TRUST_VALUES.choose(&mut rng).unwrap();
                engine
                    .set_trust_by_uri(&owner, target, value, "")
                    .unwrap();
            }
            // Own-identity trust removal, if the edge exists.
            1 => {
                let owner = *owners.choose(&mut rng).unwrap();
                let target = pool.choose(&mut rng).unwrap().derived_id();
                let _ = engine.remove_trust(&owner, &target);
            }
            // Cross-owner opinion.
            2 => {
                let value = *TRUST_VALUES.choose(&mut rng).unwrap();
                engine.set_trust(&o1, &o2, value, "peer").unwrap();
            }
            // Trust-list import for a random known remote identity.
            _ => {
                let truster = pool.choose(&mut rng).unwrap().derived_id();
                if db.get_identity(&truster).unwrap().is_none() {
                    continue;
                }
                let edition = next_edition.entry(truster).or_insert(0);
                *edition += 1;
                let entries: Vec<TrustListEntry> = pool
                    .iter()
                    .filter(|u| u.derived_id() != truster)
                    .filter_map(|u| {
                        if !rng.gen_bool(0.3) {
                            return None;
                        }
                        Some(TrustListEntry {
                            trustee_uri: u.with_edition(rng.gen_range(0..5)),
                            value: *TRUST_VALUES.choose(&mut rng).unwrap(),
                            comment: format!("round {round}"),
                        })
                    })
                    .collect();
                let file = IdentityFile {
                    nickname: format!("peer{}", truster.to_base64().chars().next().unwrap()),
                    publishes_trust_list: true,
                    contexts: vec![],
                    properties: BTreeMap::new(),
                    trust_list: entries,
                };
                engine.begin_trust_list_import().unwrap();
                match engine.import_trust_list(&truster, *edition, &file) {
                    Ok(()) => engine.finish_trust_list_import().unwrap(),
                    Err(_) => engine.abort_trust_list_import(),
                }
            }
        }
    }

    audit(&db, &mut engine, &owners);

    // The structural checks agree.
    engine.startup_integrity_test().unwrap();

    // And a full recomputation is a no-op on a consistent store.
    assert_eq!(engine.compute_all_scores_from_scratch().unwrap(), 0);
}

fn audit(db: &GraphDb, engine: &mut ScoreEngine, owners: &[IdentityId]) {
    let scores = db.iter_scores().unwrap();
    assert!(!scores.is_empty());

    for score in &scores {
        let direct = db
            .get_trust(&TrustId::new(score.owner, score.target))
            .unwrap();
        let distrusted = direct.as_ref().is_some_and(|t| t.value < 0);

        if score.owner == score.target {
            assert_eq!((score.value, score.rank, score.capacity), (i32::MAX, 0, 100));
            continue;
        }

        // Capacity law.
        assert_eq!(
            score.capacity,
            capacity_for_rank(score.rank, distrusted),
            "capacity law violated for {}",
            score.id()
        );
        if score.rank == MAX_RANK {
            assert_eq!(score.capacity, 0);
        }

        // Value law: direct opinion dominates, otherwise the weighted sum.
        let expected = match &direct {
            Some(trust) => trust.value as i32,
            None => {
                let mut sum = 0i32;
                for trust in db.trusts_by_trustee(&score.target).unwrap() {
                    let capacity = if trust.truster == score.owner {
                        100
                    } else {
                        db.get_score(&weft_core::types::ScoreId::new(score.owner, trust.truster))
                            .unwrap()
                            .map(|s| s.capacity)
                            .unwrap_or(0)
                    };
                    if capacity > 0 {
                        sum += capacity as i32 * trust.value as i32 / 100;
                    }
                }
                sum
            }
        };
        assert_eq!(score.value, expected, "value law violated for {}", score.id());
    }

    // Edition tags never exceed the truster's processed edition.
    for trust in db.iter_trusts().unwrap() {
        let truster = db.get_identity(&trust.truster).unwrap().unwrap();
        assert!(
            trust.truster_edition <= truster.request_uri.edition,
            "trust {} tagged beyond its truster's edition",
            trust.id()
        );
    }

    // Fetch policy is exactly the stored-score predicate, and every
    // surviving identity is either own or scored somewhere.
    for identity in db.iter_identities().unwrap() {
        let scores = db.scores_of_target(&identity.id).unwrap();
        let expected = scores.iter().any(|s| s.value >= 0 || s.capacity > 0);
        assert_eq!(
            engine.should_fetch_identity(&identity.id).unwrap(),
            expected
        );
        if !identity.is_own() {
            assert!(
                !scores.is_empty(),
                "identity {} survives without any score",
                identity.id
            );
        }
    }

    // Both owners still hold exactly one self-score.
    for owner in owners {
        let self_score = db
            .get_score(&weft_core::types::ScoreId::new(*owner, *owner))
            .unwrap()
            .expect("own identity keeps its self-score");
        assert_eq!(self_score.capacity, 100);
    }
}
