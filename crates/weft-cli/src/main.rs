//! weft-cli
//!
//! Offline maintenance for a Weft store. The node must not be running.
//!
//! Usage:
//!   weft-cli test-and-repair                      --db <path>
//!   weft-cli trust-value-histogram                --db <path>
//!   weft-cli trustee-count-histogram              --db <path>
//!   weft-cli benchmark-remove-trust-destructive <out> <seed> --db <path>
//!
//! Exit codes: 0 success, 1 usage error, 2 corruption, 3 other error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use weft_core::clock::SystemClock;
use weft_core::error::WotError;
use weft_core::types::TrustId;
use weft_graph::{NullScheduler, ScoreEngine, SubscriptionManager};
use weft_store::{GraphDb, WriteBatch};

#[derive(Parser, Debug)]
#[command(name = "weft-cli", version, about = "Weft store maintenance")]
struct Args {
    /// Path to the graph store directory.
    #[arg(long, global = true, default_value = "~/.weft/data/graph")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check structural integrity; drop dangling objects and rebuild the
    /// score table if anything is wrong.
    TestAndRepair,

    /// Distribution of trust values across all edges.
    TrustValueHistogram,

    /// Distribution of outgoing-edge counts per identity.
    TrusteeCountHistogram,

    /// Time `remove_trust` across every own-identity edge, in seeded
    /// random order, writing a CSV. DESTROYS the store's trust edges.
    BenchmarkRemoveTrustDestructive {
        /// CSV output path.
        out: PathBuf,
        /// RNG seed for the removal order.
        seed: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    let db_path = expand_tilde(&args.db);
    let result = match args.command {
        Command::TestAndRepair => test_and_repair(&db_path),
        Command::TrustValueHistogram => trust_value_histogram(&db_path),
        Command::TrusteeCountHistogram => trustee_count_histogram(&db_path),
        Command::BenchmarkRemoveTrustDestructive { out, seed } => {
            benchmark_remove_trust(&db_path, &out, seed)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if e.downcast_ref::<WotError>()
                .is_some_and(|w| matches!(w, WotError::Corruption(_) | WotError::Duplicate(_)))
            {
                ExitCode::from(2)
            } else {
                ExitCode::from(3)
            }
        }
    }
}

fn open_engine(db_path: &PathBuf) -> anyhow::Result<(Arc<GraphDb>, ScoreEngine)> {
    let db = Arc::new(GraphDb::open(db_path).context("opening store")?);
    let engine = ScoreEngine::new(
        Arc::clone(&db),
        Arc::new(SystemClock),
        Arc::new(NullScheduler),
        Arc::new(SubscriptionManager::new()),
        false,
    );
    Ok((db, engine))
}

// ── test-and-repair ──────────────────────────────────────────────────────────

fn test_and_repair(db_path: &PathBuf) -> anyhow::Result<()> {
    let (db, mut engine) = open_engine(db_path)?;

    if engine.startup_integrity_test().is_ok() {
        info!("store is structurally sound");
        let corrections = engine.verify_and_correct_stored_scores()?;
        info!(corrections, "score table verified");
        return Ok(());
    }
    warn!("integrity test failed, repairing");

    // Drop edges and scores whose endpoints no longer exist.
    let mut batch = WriteBatch::new(Arc::clone(&db));
    let mut dropped = 0usize;
    for trust in db.iter_trusts()? {
        let dangling = db.get_identity(&trust.truster)?.is_none()
            || db.get_identity(&trust.trustee)?.is_none()
            || trust.truster == trust.trustee;
        if dangling {
            batch.delete_trust(&trust.id());
            dropped += 1;
        }
    }
    for score in db.iter_scores()? {
        let owner = db.get_identity(&score.owner)?;
        let dangling = !owner.as_ref().is_some_and(|o| o.is_own())
            || db.get_identity(&score.target)?.is_none();
        if dangling {
            batch.delete_score(&score.id());
            dropped += 1;
        }
    }
    batch.commit()?;
    info!(dropped, "dangling objects removed");

    // Rebuild the derived state and re-check.
    let corrections = engine.verify_and_correct_stored_scores()?;
    info!(corrections, "score table rebuilt");
    engine
        .startup_integrity_test()
        .context("store still corrupt after repair")?;
    info!("repair complete");
    Ok(())
}

// ── Histograms ───────────────────────────────────────────────────────────────

fn trust_value_histogram(db_path: &PathBuf) -> anyhow::Result<()> {
    let (db, _) = open_engine(db_path)?;
    let mut histogram: BTreeMap<i8, u64> = BTreeMap::new();
    for trust in db.iter_trusts()? {
        *histogram.entry(trust.value).or_insert(0) += 1;
    }
    println!("value,count");
    for (value, count) in histogram {
        println!("{value},{count}");
    }
    Ok(())
}

fn trustee_count_histogram(db_path: &PathBuf) -> anyhow::Result<()> {
    let (db, _) = open_engine(db_path)?;
    let mut per_truster: BTreeMap<String, u64> = BTreeMap::new();
    for trust in db.iter_trusts()? {
        *per_truster.entry(trust.truster.to_base64()).or_insert(0) += 1;
    }
    // Identities without outgoing edges count in the zero bucket.
    let without_edges = db.count_identities() - per_truster.len() as u64;
    let mut histogram: BTreeMap<u64, u64> = BTreeMap::new();
    if without_edges > 0 {
        histogram.insert(0, without_edges);
    }
    for count in per_truster.into_values() {
        *histogram.entry(count).or_insert(0) += 1;
    }
    println!("trustees,identities");
    for (trustees, identities) in histogram {
        println!("{trustees},{identities}");
    }
    Ok(())
}

// ── Benchmark ────────────────────────────────────────────────────────────────

fn benchmark_remove_trust(db_path: &PathBuf, out: &PathBuf, seed: u64) -> anyhow::Result<()> {
    let (db, mut engine) = open_engine(db_path)?;

    // Only edges from own identities can be removed through the engine.
    let own: Vec<_> = db.own_identities()?.into_iter().map(|i| i.id).collect();
    let mut edges = Vec::new();
    for owner in &own {
        for trust in db.trusts_by_truster(owner)? {
            edges.push((trust.truster, trust.trustee));
        }
    }
    if edges.is_empty() {
        anyhow::bail!("no own-identity trust edges to benchmark");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    edges.shuffle(&mut rng);

    let mut csv = String::from("index,micros\n");
    for (index, (truster, trustee)) in edges.iter().enumerate() {
        // Earlier removals may have collected this edge's trustee already.
        if db.get_trust(&TrustId::new(*truster, *trustee))?.is_none() {
            continue;
        }
        let started = Instant::now();
        engine.remove_trust(truster, trustee)?;
        let micros = started.elapsed().as_micros();
        csv.push_str(&format!("{index},{micros}\n"));
    }
    std::fs::write(out, csv).with_context(|| format!("writing {}", out.display()))?;
    info!(edges = edges.len(), out = %out.display(), "benchmark complete");
    Ok(())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
