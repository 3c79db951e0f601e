use std::collections::BTreeMap;
use std::sync::Arc;

use weft_core::config::Configuration;
use weft_core::error::WotError;
use weft_core::identity::Identity;
use weft_core::score::Score;
use weft_core::trust::Trust;
use weft_core::types::{IdentityId, ScoreId, TrustId};

use crate::commands::DownloadCommand;
use crate::db::GraphDb;

/// All mutations staged by one graph transaction, committed atomically at
/// the end or discarded wholesale by dropping the batch.
///
/// Reads go through the overlay first, so score recomputation observes its
/// own staged writes. `None` in an overlay slot is a staged deletion.
pub struct WriteBatch {
    db: Arc<GraphDb>,
    identities: BTreeMap<IdentityId, Option<Identity>>,
    trusts: BTreeMap<(IdentityId, IdentityId), Option<Trust>>,
    scores: BTreeMap<(IdentityId, IdentityId), Option<Score>>,
    commands: BTreeMap<IdentityId, DownloadCommand>,
    config: Option<Configuration>,
}

impl WriteBatch {
    pub fn new(db: Arc<GraphDb>) -> Self {
        Self {
            db,
            identities: BTreeMap::new(),
            trusts: BTreeMap::new(),
            scores: BTreeMap::new(),
            commands: BTreeMap::new(),
            config: None,
        }
    }

    pub fn db(&self) -> &GraphDb {
        &self.db
    }

    // ── Identities ───────────────────────────────────────────────────────────

    pub fn get_identity(&self, id: &IdentityId) -> Result<Option<Identity>, WotError> {
        if let Some(staged) = self.identities.get(id) {
            return Ok(staged.clone());
        }
        self.db.get_identity(id)
    }

    pub fn put_identity(&mut self, identity: Identity) {
        self.identities.insert(identity.id, Some(identity));
    }

    pub fn delete_identity(&mut self, id: IdentityId) {
        self.identities.insert(id, None);
    }

    /// All identities, overlay merged over the stored set.
    pub fn identities(&self) -> Result<Vec<Identity>, WotError> {
        let mut merged: BTreeMap<IdentityId, Identity> = self
            .db
            .iter_identities()?
            .into_iter()
            .map(|i| (i.id, i))
            .collect();
        for (id, staged) in &self.identities {
            match staged {
                Some(identity) => {
                    merged.insert(*id, identity.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn own_identities(&self) -> Result<Vec<Identity>, WotError> {
        Ok(self
            .identities()?
            .into_iter()
            .filter(Identity::is_own)
            .collect())
    }

    // ── Trusts ───────────────────────────────────────────────────────────────

    pub fn get_trust(&self, id: &TrustId) -> Result<Option<Trust>, WotError> {
        if let Some(staged) = self.trusts.get(&(id.truster, id.trustee)) {
            return Ok(staged.clone());
        }
        self.db.get_trust(id)
    }

    pub fn put_trust(&mut self, trust: Trust) {
        self.trusts.insert((trust.truster, trust.trustee), Some(trust));
    }

    pub fn delete_trust(&mut self, id: &TrustId) {
        self.trusts.insert((id.truster, id.trustee), None);
    }

    pub fn trusts_by_truster(&self, truster: &IdentityId) -> Result<Vec<Trust>, WotError> {
        let mut merged: BTreeMap<(IdentityId, IdentityId), Trust> = self
            .db
            .trusts_by_truster(truster)?
            .into_iter()
            .map(|t| ((t.truster, t.trustee), t))
            .collect();
        self.apply_trust_overlay(&mut merged, |key| key.0 == *truster);
        Ok(merged.into_values().collect())
    }

    pub fn trusts_by_trustee(&self, trustee: &IdentityId) -> Result<Vec<Trust>, WotError> {
        let mut merged: BTreeMap<(IdentityId, IdentityId), Trust> = self
            .db
            .trusts_by_trustee(trustee)?
            .into_iter()
            .map(|t| ((t.truster, t.trustee), t))
            .collect();
        self.apply_trust_overlay(&mut merged, |key| key.1 == *trustee);
        Ok(merged.into_values().collect())
    }

    fn apply_trust_overlay<F>(
        &self,
        merged: &mut BTreeMap<(IdentityId, IdentityId), Trust>,
        matches: F,
    ) where
        F: Fn(&(IdentityId, IdentityId)) -> bool,
    {
        for (key, staged) in self.trusts.iter().filter(|(k, _)| matches(k)) {
            match staged {
                Some(trust) => {
                    merged.insert(*key, trust.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
    }

    // ── Scores ───────────────────────────────────────────────────────────────

    pub fn get_score(&self, id: &ScoreId) -> Result<Option<Score>, WotError> {
        if let Some(staged) = self.scores.get(&(id.owner, id.target)) {
            return Ok(*staged);
        }
        self.db.get_score(id)
    }

    pub fn put_score(&mut self, score: Score) {
        self.scores.insert((score.owner, score.target), Some(score));
    }

    pub fn delete_score(&mut self, id: &ScoreId) {
        self.scores.insert((id.owner, id.target), None);
    }

    pub fn scores_of_owner(&self, owner: &IdentityId) -> Result<Vec<Score>, WotError> {
        let mut merged: BTreeMap<(IdentityId, IdentityId), Score> = self
            .db
            .scores_of_owner(owner)?
            .into_iter()
            .map(|s| ((s.owner, s.target), s))
            .collect();
        self.apply_score_overlay(&mut merged, |key| key.0 == *owner);
        Ok(merged.into_values().collect())
    }

    pub fn scores_of_target(&self, target: &IdentityId) -> Result<Vec<Score>, WotError> {
        let mut merged: BTreeMap<(IdentityId, IdentityId), Score> = self
            .db
            .scores_of_target(target)?
            .into_iter()
            .map(|s| ((s.owner, s.target), s))
            .collect();
        self.apply_score_overlay(&mut merged, |key| key.1 == *target);
        Ok(merged.into_values().collect())
    }

    fn apply_score_overlay<F>(
        &self,
        merged: &mut BTreeMap<(IdentityId, IdentityId), Score>,
        matches: F,
    ) where
        F: Fn(&(IdentityId, IdentityId)) -> bool,
    {
        for (key, staged) in self.scores.iter().filter(|(k, _)| matches(k)) {
            match staged {
                Some(score) => {
                    merged.insert(*key, *score);
                }
                None => {
                    merged.remove(key);
                }
            }
        }
    }

    // ── Commands / configuration ─────────────────────────────────────────────

    /// Stage a download command. The table holds one row per identity, so
    /// a later command inside the same transaction replaces the earlier one
    /// — start-then-stop collapses to its net effect.
    pub fn stage_command(&mut self, command: DownloadCommand) {
        self.commands.insert(command.id, command);
    }

    pub fn set_configuration(&mut self, config: Configuration) {
        self.config = Some(config);
    }

    pub fn configuration(&self) -> Result<Configuration, WotError> {
        match &self.config {
            Some(c) => Ok(c.clone()),
            None => self.db.configuration(),
        }
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Apply everything staged and flush. Consumes the batch; dropping a
    /// batch without calling this discards all staged work.
    pub fn commit(self) -> Result<(), WotError> {
        let mut identities = sled::Batch::default();
        for (id, staged) in &self.identities {
            let key = id.to_base64().into_bytes();
            match staged {
                Some(identity) => {
                    let bytes = bincode::serialize(identity)
                        .map_err(|e| WotError::Serialization(e.to_string()))?;
                    identities.insert(key, bytes);
                }
                None => identities.remove(key),
            }
        }

        let mut trusts = sled::Batch::default();
        let mut trusts_rev = sled::Batch::default();
        for ((truster, trustee), staged) in &self.trusts {
            let id = TrustId::new(*truster, *trustee);
            let rev_key = format!("{trustee}@{truster}").into_bytes();
            match staged {
                Some(trust) => {
                    let bytes = bincode::serialize(trust)
                        .map_err(|e| WotError::Serialization(e.to_string()))?;
                    trusts.insert(id.key_bytes(), bytes);
                    trusts_rev.insert(rev_key, &[][..]);
                }
                None => {
                    trusts.remove(id.key_bytes());
                    trusts_rev.remove(rev_key);
                }
            }
        }

        let mut scores = sled::Batch::default();
        let mut scores_rev = sled::Batch::default();
        for ((owner, target), staged) in &self.scores {
            let id = ScoreId::new(*owner, *target);
            let rev_key = format!("{target}@{owner}").into_bytes();
            match staged {
                Some(score) => {
                    let bytes = bincode::serialize(score)
                        .map_err(|e| WotError::Serialization(e.to_string()))?;
                    scores.insert(id.key_bytes(), bytes);
                    scores_rev.insert(rev_key, &[][..]);
                }
                None => {
                    scores.remove(id.key_bytes());
                    scores_rev.remove(rev_key);
                }
            }
        }

        let mut commands = sled::Batch::default();
        for (id, command) in &self.commands {
            let bytes = bincode::serialize(command)
                .map_err(|e| WotError::Serialization(e.to_string()))?;
            commands.insert(id.to_base64().into_bytes(), bytes);
        }

        self.db.identities.apply_batch(identities).map_err(|e| WotError::Storage(e.to_string()))?;
        self.db.trusts.apply_batch(trusts).map_err(|e| WotError::Storage(e.to_string()))?;
        self.db.trusts_by_trustee.apply_batch(trusts_rev).map_err(|e| WotError::Storage(e.to_string()))?;
        self.db.scores.apply_batch(scores).map_err(|e| WotError::Storage(e.to_string()))?;
        self.db.scores_by_target.apply_batch(scores_rev).map_err(|e| WotError::Storage(e.to_string()))?;
        self.db.commands.apply_batch(commands).map_err(|e| WotError::Storage(e.to_string()))?;
        if let Some(config) = &self.config {
            self.db.put_configuration(config)?;
        }
        self.db.flush()
    }
}
