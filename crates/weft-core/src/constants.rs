//! ─── Weft Protocol Constants ────────────────────────────────────────────────
//!
//! A web of trust for an anonymous content-addressed network: every identity
//! publishes a signed trust list; every locally-owned identity derives a
//! score tree over the union of all collected lists.

// ── URI namespace ────────────────────────────────────────────────────────────

/// Document namespace inside identity URIs. All files published by this web
/// live under `K@.../WebOfTrust/<edition>`; parallel independent webs would
/// use a different name.
pub const WOT_NAME: &str = "WebOfTrust";

/// Protocol version of the identity XML format we read and write.
pub const XML_FORMAT_VERSION: u32 = 1;

// ── Trust values ─────────────────────────────────────────────────────────────

/// Lower bound of a trust opinion (inclusive).
pub const MIN_TRUST_VALUE: i8 = -100;

/// Upper bound of a trust opinion (inclusive).
pub const MAX_TRUST_VALUE: i8 = 100;

/// Maximum length of a trust comment, in characters.
pub const MAX_TRUST_COMMENT_LEN: usize = 256;

// ── Identity attributes ──────────────────────────────────────────────────────

/// Maximum nickname length in characters. Nicknames are immutable once set.
pub const MAX_NICKNAME_LEN: usize = 30;

/// Maximum number of contexts per identity.
pub const MAX_CONTEXT_COUNT: usize = 32;

/// Maximum length of a single context name (alphanumeric only).
pub const MAX_CONTEXT_NAME_LEN: usize = 32;

/// Maximum number of properties per identity.
pub const MAX_PROPERTY_COUNT: usize = 64;

/// Maximum length of a property key (alphanumeric plus dot).
pub const MAX_PROPERTY_KEY_LEN: usize = 256;

/// Maximum size of a property value, in bytes.
pub const MAX_PROPERTY_VALUE_BYTES: usize = 10 * 1024;

// ── Score computation ────────────────────────────────────────────────────────

/// Rank-indexed capacity attenuation. Index = rank, clamped to the last
/// entry for deeper ranks. Rank 0 is the tree owner itself.
pub const CAPACITY_TABLE: [u8; 6] = [100, 40, 16, 6, 2, 1];

/// Sentinel rank for identities reachable only through hostile (negative)
/// edges. Capacity at this rank is always 0.
pub const MAX_RANK: u32 = u32::MAX;

// ── Wire format limits ───────────────────────────────────────────────────────

/// Hard ceiling on a fetched identity file.
pub const MAX_IDENTITY_FILE_BYTES: usize = 1024 * 1024;

/// Maximum number of trust entries a single identity file may carry.
pub const MAX_TRUST_LIST_ENTRIES: usize = 512;

/// Hard ceiling on an identity-introduction file.
pub const MAX_INTRODUCTION_FILE_BYTES: usize = 1024;

/// Hard ceiling on an introduction-puzzle file.
pub const MAX_PUZZLE_FILE_BYTES: usize = 16 * 1024;

// ── Ingestion ────────────────────────────────────────────────────────────────

/// How long the file processor sleeps after a wakeup before draining the
/// queue. The window lets the queue deduplicate superseded editions.
pub const PROCESSING_DELAY_SECS: i64 = 5 * 60;

// ── Store maintenance ────────────────────────────────────────────────────────

/// Interval between store defragmentation passes.
pub const DEFAULT_DEFRAG_INTERVAL_SECS: i64 = 7 * 24 * 3600;

/// Interval between full stored-score verification passes.
pub const DEFAULT_VERIFY_SCORES_INTERVAL_SECS: i64 = 28 * 24 * 3600;

// ── Slow downloader ──────────────────────────────────────────────────────────

/// Concurrent edition-hint downloads.
pub const MAX_RUNNING_DOWNLOADS: usize = 64;

/// First retry delay after a temporary download failure. Doubles per attempt.
pub const SLOW_RETRY_BASE_DELAY_SECS: i64 = 60;

/// Ceiling on the per-attempt retry delay.
pub const SLOW_RETRY_MAX_DELAY_SECS: i64 = 3600;

/// Attempts before a temporarily-failing download is abandoned.
pub const SLOW_MAX_RETRIES: u32 = 5;

// ── Inserter ─────────────────────────────────────────────────────────────────

/// An unchanged own identity is re-inserted after this long, as a liveness
/// signal to the network.
pub const MAX_UNCHANGED_TIME_BEFORE_REINSERT_SECS: i64 = 3 * 24 * 3600;

/// Rapid edits within this window are coalesced into one insert.
pub const MIN_DELAY_BEFORE_INSERT_SECS: i64 = 3600;

/// An insert is never deferred longer than this after the previous one.
pub const MAX_DELAY_BEFORE_INSERT_SECS: i64 = 3 * 3600;

// ── Database ─────────────────────────────────────────────────────────────────

/// Current on-disk format. Upgrade routines run at startup before any other
/// subsystem touches the store.
pub const DATABASE_FORMAT_VERSION: u32 = 1;

// ── Seed identities ──────────────────────────────────────────────────────────

/// Well-connected request URIs newcomers use to bootstrap the web. Fetched
/// on first start; their trust lists pull in the rest of the graph.
pub const SEED_IDENTITY_URIS: &[&str] = &[
    "K@ERERERERERERERERERERERERERERERERERERERERERE,MzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzMzM,AQACAAE/WebOfTrust/0",
    "K@KSkpKSkpKSkpKSkpKSkpKSkpKSkpKSkpKSkpKSkpKSk,e3t7e3t7e3t7e3t7e3t7e3t7e3t7e3t7e3t7e3t7e3s,AQACAAE/WebOfTrust/0",
    "K@Xl5eXl5eXl5eXl5eXl5eXl5eXl5eXl5eXl5eXl5eXl4,GhoaGhoaGhoaGhoaGhoaGhoaGhoaGhoaGhoaGhoaGho,AQACAAE/WebOfTrust/0",
    "K@g4ODg4ODg4ODg4ODg4ODg4ODg4ODg4ODg4ODg4ODg4M,iYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYk,AQACAAE/WebOfTrust/0",
];
