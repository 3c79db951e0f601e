use std::path::Path;

use weft_core::config::Configuration;
use weft_core::error::WotError;
use weft_core::identity::Identity;
use weft_core::score::Score;
use weft_core::trust::Trust;
use weft_core::types::{IdentityId, ScoreId, TrustId};

use crate::commands::DownloadCommand;

/// Persistent graph database backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   identities        — id b64 bytes        → bincode(Identity)
///   trusts            — "truster@trustee"   → bincode(Trust)
///   trusts_by_trustee — "trustee@truster"   → [] (reverse membership)
///   scores            — "owner@target"      → bincode(Score)
///   scores_by_target  — "target@owner"      → [] (reverse membership)
///   commands          — id b64 bytes        → bincode(DownloadCommand)
///   config            — b"config"           → bincode(Configuration)
///
/// At most one writer mutates the graph at a time (the engine lock); all
/// mutation goes through [`crate::batch::WriteBatch`] so a failed operation
/// stages nothing.
pub struct GraphDb {
    pub(crate) db: sled::Db,
    pub(crate) identities: sled::Tree,
    pub(crate) trusts: sled::Tree,
    pub(crate) trusts_by_trustee: sled::Tree,
    pub(crate) scores: sled::Tree,
    pub(crate) scores_by_target: sled::Tree,
    pub(crate) commands: sled::Tree,
    pub(crate) config: sled::Tree,
}

const CONFIG_KEY: &[u8] = b"config";

impl GraphDb {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WotError> {
        let db = sled::open(path).map_err(|e| WotError::Storage(e.to_string()))?;
        let identities        = db.open_tree("identities").map_err(|e| WotError::Storage(e.to_string()))?;
        let trusts            = db.open_tree("trusts").map_err(|e| WotError::Storage(e.to_string()))?;
        let trusts_by_trustee = db.open_tree("trusts_by_trustee").map_err(|e| WotError::Storage(e.to_string()))?;
        let scores            = db.open_tree("scores").map_err(|e| WotError::Storage(e.to_string()))?;
        let scores_by_target  = db.open_tree("scores_by_target").map_err(|e| WotError::Storage(e.to_string()))?;
        let commands          = db.open_tree("commands").map_err(|e| WotError::Storage(e.to_string()))?;
        let config            = db.open_tree("config").map_err(|e| WotError::Storage(e.to_string()))?;
        Ok(Self { db, identities, trusts, trusts_by_trustee, scores, scores_by_target, commands, config })
    }

    // ── Identities ───────────────────────────────────────────────────────────

    pub fn get_identity(&self, id: &IdentityId) -> Result<Option<Identity>, WotError> {
        match self.identities.get(id.to_base64().as_bytes()).map_err(|e| WotError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn identity_exists(&self, id: &IdentityId) -> bool {
        self.identities
            .contains_key(id.to_base64().as_bytes())
            .unwrap_or(false)
    }

    /// Every identity in the store.
    pub fn iter_identities(&self) -> Result<Vec<Identity>, WotError> {
        let mut out = Vec::new();
        for item in self.identities.iter() {
            let (_, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    /// Every locally-owned identity.
    pub fn own_identities(&self) -> Result<Vec<Identity>, WotError> {
        Ok(self
            .iter_identities()?
            .into_iter()
            .filter(Identity::is_own)
            .collect())
    }

    // ── Trusts ───────────────────────────────────────────────────────────────

    pub fn get_trust(&self, id: &TrustId) -> Result<Option<Trust>, WotError> {
        match self.trusts.get(id.key_bytes()).map_err(|e| WotError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// All edges leaving `truster`.
    pub fn trusts_by_truster(&self, truster: &IdentityId) -> Result<Vec<Trust>, WotError> {
        let mut out = Vec::new();
        for item in self.trusts.scan_prefix(TrustId::truster_prefix(truster)) {
            let (_, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    /// All edges arriving at `trustee`, resolved through the reverse index.
    pub fn trusts_by_trustee(&self, trustee: &IdentityId) -> Result<Vec<Trust>, WotError> {
        let mut out = Vec::new();
        let prefix = format!("{trustee}@").into_bytes();
        for item in self.trusts_by_trustee.scan_prefix(&prefix) {
            let (key, _) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            let key = std::str::from_utf8(&key)
                .map_err(|e| WotError::Corruption(format!("non-utf8 trust index key: {e}")))?;
            let truster_b64 = &key[prefix.len()..];
            let truster = IdentityId::from_base64(truster_b64)
                .map_err(|_| WotError::Corruption(format!("bad trust index key: {key}")))?;
            let trust_id = TrustId::new(truster, *trustee);
            match self.get_trust(&trust_id)? {
                Some(t) => out.push(t),
                None => {
                    return Err(WotError::Corruption(format!(
                        "trust index points at missing edge {trust_id}"
                    )))
                }
            }
        }
        Ok(out)
    }

    pub fn iter_trusts(&self) -> Result<Vec<Trust>, WotError> {
        let mut out = Vec::new();
        for item in self.trusts.iter() {
            let (_, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    // ── Scores ───────────────────────────────────────────────────────────────

    pub fn get_score(&self, id: &ScoreId) -> Result<Option<Score>, WotError> {
        match self.scores.get(id.key_bytes()).map_err(|e| WotError::Storage(e.to_string()))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// The whole score tree of one own identity.
    pub fn scores_of_owner(&self, owner: &IdentityId) -> Result<Vec<Score>, WotError> {
        let mut out = Vec::new();
        for item in self.scores.scan_prefix(ScoreId::owner_prefix(owner)) {
            let (_, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    /// Every owner's score for one target, resolved through the reverse
    /// index.
    pub fn scores_of_target(&self, target: &IdentityId) -> Result<Vec<Score>, WotError> {
        let mut out = Vec::new();
        let prefix = format!("{target}@").into_bytes();
        for item in self.scores_by_target.scan_prefix(&prefix) {
            let (key, _) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            let key = std::str::from_utf8(&key)
                .map_err(|e| WotError::Corruption(format!("non-utf8 score index key: {e}")))?;
            let owner_b64 = &key[prefix.len()..];
            let owner = IdentityId::from_base64(owner_b64)
                .map_err(|_| WotError::Corruption(format!("bad score index key: {key}")))?;
            let score_id = ScoreId::new(owner, *target);
            match self.get_score(&score_id)? {
                Some(s) => out.push(s),
                None => {
                    return Err(WotError::Corruption(format!(
                        "score index points at missing score {score_id}"
                    )))
                }
            }
        }
        Ok(out)
    }

    pub fn iter_scores(&self) -> Result<Vec<Score>, WotError> {
        let mut out = Vec::new();
        for item in self.scores.iter() {
            let (_, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    // ── Download commands ────────────────────────────────────────────────────

    /// Drain every pending command, removing them from the table.
    pub fn take_commands(&self) -> Result<Vec<DownloadCommand>, WotError> {
        let mut out = Vec::new();
        for item in self.commands.iter() {
            let (key, bytes) = item.map_err(|e| WotError::Storage(e.to_string()))?;
            out.push(
                bincode::deserialize::<DownloadCommand>(&bytes)
                    .map_err(|e| WotError::Serialization(e.to_string()))?,
            );
            self.commands
                .remove(key)
                .map_err(|e| WotError::Storage(e.to_string()))?;
        }
        Ok(out)
    }

    pub fn pending_command_count(&self) -> usize {
        self.commands.len()
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Load the configuration record, or a fresh default for a new store.
    pub fn configuration(&self) -> Result<Configuration, WotError> {
        match self.config.get(CONFIG_KEY).map_err(|e| WotError::Storage(e.to_string()))? {
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| WotError::Serialization(e.to_string()))
            }
            None => Ok(Configuration::new()),
        }
    }

    /// Write the configuration record immediately (outside any batch).
    pub fn put_configuration(&self, config: &Configuration) -> Result<(), WotError> {
        let bytes =
            bincode::serialize(config).map_err(|e| WotError::Serialization(e.to_string()))?;
        self.config
            .insert(CONFIG_KEY, bytes)
            .map_err(|e| WotError::Storage(e.to_string()))?;
        Ok(())
    }

    // ── Counters / flush ─────────────────────────────────────────────────────

    pub fn count_identities(&self) -> u64 {
        self.identities.len() as u64
    }

    pub fn count_trusts(&self) -> u64 {
        self.trusts.len() as u64
    }

    pub fn count_scores(&self) -> u64 {
        self.scores.len() as u64
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), WotError> {
        self.db.flush().map_err(|e| WotError::Storage(e.to_string()))?;
        Ok(())
    }
}
