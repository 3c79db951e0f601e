//! End-to-end smoke test for weft-node.
//!
//! Starts the real binary with a fresh data directory and a bootstrap
//! identity, waits for startup to complete, then inspects the store it
//! left behind.
//!
//! Run with:
//!   cargo test -p weft-node --test smoke

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::uri::SEED_IDENTITIES;
use weft_store::GraphDb;

struct NodeGuard {
    child: Child,
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn bootstrap_startup_seeds_the_graph() {
    let data_dir = std::env::temp_dir().join(format!("weft_e2e_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&data_dir);

    let node_bin = env!("CARGO_BIN_EXE_weft-node");
    let mut child = Command::new(node_bin)
        .args([
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--create-identity",
            "smoketest",
            "--debug-incremental-scores",
        ])
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn weft-node");

    // Wait until the startup sequence has finished.
    let stdout = child.stdout.take().expect("piped stdout");
    let mut guard = NodeGuard { child };
    let mut ready = false;
    let reader = BufReader::new(stdout);
    let deadline = Instant::now() + Duration::from_secs(30);
    for line in reader.lines() {
        let line = line.unwrap_or_default();
        if line.contains("node ready") {
            ready = true;
            break;
        }
        if Instant::now() > deadline {
            break;
        }
    }
    assert!(ready, "node did not reach readiness within 30 seconds");

    // Stop the node and inspect what it persisted.
    let _ = guard.child.kill();
    let _ = guard.child.wait();
    let db = Arc::new(GraphDb::open(data_dir.join("graph")).expect("reopen store"));

    let own: Vec<_> = db.own_identities().unwrap();
    assert_eq!(own.len(), 1);
    let own = &own[0];
    assert_eq!(own.nickname.as_deref(), Some("smoketest"));

    // Every seed identity is registered and trusted at full strength.
    let trusts = db.trusts_by_truster(&own.id).unwrap();
    assert_eq!(trusts.len(), SEED_IDENTITIES.len());
    assert!(trusts.iter().all(|t| t.value == 100));
    for seed in SEED_IDENTITIES.iter() {
        let seed_id = seed.derived_id();
        assert!(db.get_identity(&seed_id).unwrap().is_some());
        let scores = db.scores_of_target(&seed_id).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!((scores[0].rank, scores[0].capacity), (1, 40));
    }

    drop(db);
    let _ = std::fs::remove_dir_all(&data_dir);
}
