//! weft-node — the Weft daemon.
//!
//! Startup sequence:
//!   1. Open the store, read the configuration, upgrade the database
//!      format if an older version is on disk
//!   2. Defragment the backing files when the interval has elapsed (or an
//!      own-identity deletion re-scheduled it)
//!   3. Run the startup integrity test — corruption aborts startup
//!   4. Verify stored scores when that interval has elapsed
//!   5. Start the file processor, both downloaders, and the inserter
//!   6. On Ctrl-C, signal shutdown and wait for every worker to exit —
//!      indefinitely, because killing an import mid-transaction could
//!      corrupt the derived scores
//!
//! The network transport here is the in-process simulation; a real
//! deployment plugs its transport in behind the same `ContentNetwork`
//! trait.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use weft_core::clock::{Clock, SystemClock};
use weft_core::constants::DATABASE_FORMAT_VERSION;
use weft_core::uri::SEED_IDENTITIES;
use weft_crypto::IdentityKeypair;
use weft_fetch::{DownloaderController, FastDownloader, SlowDownloader};
use weft_graph::{ScoreEngine, SubscriptionManager};
use weft_ingest::{IdentityFileProcessor, IdentityFileQueue};
use weft_insert::IdentityInserter;
use weft_net::{ContentNetwork, MemoryNetwork};
use weft_store::{maintenance, GraphDb};

#[derive(Parser, Debug)]
#[command(
    name = "weft-node",
    version,
    about = "Weft — a web-of-trust engine for anonymous content-addressed networks"
)]
struct Args {
    /// Directory for the persistent store and file queue.
    #[arg(long, default_value = "~/.weft/data")]
    data_dir: PathBuf,

    /// Create an own identity with this nickname on startup, trusting the
    /// hard-coded seed identities to bootstrap the web.
    #[arg(long)]
    create_identity: Option<String>,

    /// Assert every incremental score computation against the
    /// from-scratch reference. Expensive.
    #[arg(long)]
    debug_incremental_scores: bool,

    /// Disable queue deduplication and archive every fetched file.
    #[arg(long)]
    debug_network_dump: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,weft=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("weft node starting");

    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("graph");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();

    // ── Format check / upgrade / defragmentation (store closed between) ──────
    let defrag_due = {
        let db = GraphDb::open(&db_path).context("opening graph store")?;
        let mut config = db.configuration()?;
        if config.database_format_version > DATABASE_FORMAT_VERSION {
            bail!(
                "store format {} is newer than this build supports ({})",
                config.database_format_version,
                DATABASE_FORMAT_VERSION
            );
        }
        if config.database_format_version < DATABASE_FORMAT_VERSION {
            info!(
                from = config.database_format_version,
                to = DATABASE_FORMAT_VERSION,
                "upgrading database format"
            );
            config.database_format_version = DATABASE_FORMAT_VERSION;
            db.put_configuration(&config)?;
        }
        maintenance::defrag_due(&config, now)
    };
    if defrag_due {
        maintenance::defragment(&db_path).context("defragmenting store")?;
    }

    let db = Arc::new(GraphDb::open(&db_path).context("opening graph store")?);
    if defrag_due {
        let mut config = db.configuration()?;
        config.last_defrag = Some(now);
        db.put_configuration(&config)?;
    }

    // ── Engine ───────────────────────────────────────────────────────────────
    let events = Arc::new(SubscriptionManager::new());
    let (controller, hint_rx) = DownloaderController::new();
    let mut engine = ScoreEngine::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        controller.clone(),
        Arc::clone(&events),
        args.debug_incremental_scores,
    );

    engine
        .startup_integrity_test()
        .context("startup integrity test failed — run `weft-cli test-and-repair`")?;

    if maintenance::verify_scores_due(&db.configuration()?, now) {
        let corrections = engine
            .verify_and_correct_stored_scores()
            .context("verifying stored scores")?;
        info!(corrections, "stored scores verified");
    }

    if let Some(nickname) = &args.create_identity {
        bootstrap_own_identity(&mut engine, nickname)?;
    }

    // ── Workers ──────────────────────────────────────────────────────────────
    let engine = Arc::new(tokio::sync::Mutex::new(engine));
    let queue = Arc::new(
        IdentityFileQueue::open(
            data_dir.join("queue"),
            args.debug_network_dump,
            Arc::clone(&clock),
        )
        .context("opening identity file queue")?,
    );
    let network: Arc<dyn ContentNetwork> = Arc::new(MemoryNetwork::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor =
        IdentityFileProcessor::new(Arc::clone(&queue), Arc::clone(&engine), shutdown_rx.clone());
    let fast = FastDownloader::new(
        Arc::clone(&db),
        Arc::clone(&network),
        Arc::clone(&queue),
        controller.scheduler_lock(),
        shutdown_rx.clone(),
    );
    let slow = SlowDownloader::new(
        Arc::clone(&db),
        Arc::clone(&network),
        Arc::clone(&queue),
        controller.scheduler_lock(),
        hint_rx,
        shutdown_rx.clone(),
    );
    let inserter = IdentityInserter::new(
        Arc::clone(&engine),
        Arc::clone(&network),
        Arc::clone(&clock),
        shutdown_rx,
    );

    // Log change notifications for local observability.
    let mut notifications = events.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            debug!(
                domain = ?notification.domain,
                id = %notification.id,
                version = notification.new_version,
                "change notification"
            );
        }
    });

    let workers = vec![
        tokio::spawn(processor.run()),
        tokio::spawn(fast.run()),
        tokio::spawn(slow.run()),
        tokio::spawn(inserter.run()),
    ];
    info!("node ready");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "worker exited abnormally");
        }
    }
    db.flush()?;
    info!("node stopped");
    Ok(())
}

/// First-start bootstrap: a fresh own identity trusting the hard-coded
/// seed identities, whose trust lists pull in the rest of the web.
fn bootstrap_own_identity(engine: &mut ScoreEngine, nickname: &str) -> anyhow::Result<()> {
    let keypair = IdentityKeypair::generate();
    let own = engine
        .create_own_identity(&keypair, nickname, true)
        .context("creating own identity")?;
    info!(identity = %own.id, nickname, "own identity created");
    info!(insert_uri = %keypair.insert_uri(0), "KEEP THIS SECRET — it is the only way to restore the identity");

    for seed in SEED_IDENTITIES.iter() {
        let seed_id = engine
            .set_trust_by_uri(&own.id, seed, 100, "Bootstrap seed")
            .context("trusting seed identity")?;
        debug!(seed = %seed_id, "seed identity trusted");
    }
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
