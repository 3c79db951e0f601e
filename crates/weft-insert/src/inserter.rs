use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use weft_core::clock::Clock;
use weft_core::constants::{
    MAX_DELAY_BEFORE_INSERT_SECS, MAX_UNCHANGED_TIME_BEFORE_REINSERT_SECS,
    MIN_DELAY_BEFORE_INSERT_SECS,
};
use weft_core::error::WotError;
use weft_core::identity::Identity;
use weft_core::types::{Edition, Timestamp};
use weft_crypto::IdentityKeypair;
use weft_graph::ScoreEngine;
use weft_net::{ContentNetwork, InsertError};
use weft_xml::{encode_identity_file, IdentityFile, TrustListEntry};

#[derive(Clone, Copy, Debug, Default)]
pub struct InserterStatistics {
    pub inserted: u64,
    pub collisions: u64,
    pub failed: u64,
}

pub struct IdentityInserter {
    engine: Arc<tokio::sync::Mutex<ScoreEngine>>,
    network: Arc<dyn ContentNetwork>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    check_interval: Duration,
    stats: Arc<Mutex<InserterStatistics>>,
}

impl IdentityInserter {
    pub fn new(
        engine: Arc<tokio::sync::Mutex<ScoreEngine>>,
        network: Arc<dyn ContentNetwork>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            network,
            clock,
            shutdown,
            check_interval: Duration::from_secs(60),
            stats: Arc::new(Mutex::new(InserterStatistics::default())),
        }
    }

    pub fn statistics_handle(&self) -> Arc<Mutex<InserterStatistics>> {
        Arc::clone(&self.stats)
    }

    pub async fn run(mut self) {
        info!("identity inserter started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {
                    if let Err(e) = self.insert_due().await {
                        warn!(error = %e, "insert cycle failed");
                    }
                }
                _ = self.shutdown.changed() => break,
            }
        }
        info!("identity inserter stopped");
    }

    /// One inserter cycle: publish every own identity whose next edition
    /// is due.
    pub async fn insert_due(&self) -> Result<(), WotError> {
        let now = self.clock.now();
        let mut engine = self.engine.lock().await;

        let candidates: Vec<Identity> = engine
            .own_identities()?
            .into_iter()
            .filter(|identity| !identity.in_restore())
            .collect();

        for identity in candidates {
            let Some(own) = identity.own.clone() else { continue };
            if !needs_insert(&identity, own.last_insert, now)
                || !delay_elapsed(&identity, own.last_insert, now)
            {
                continue;
            }
            let Some(nickname) = identity.nickname.clone() else {
                debug!(identity = %identity.id, "no nickname yet, skipping insert");
                continue;
            };

            let next_edition: Edition = match own.last_insert {
                None => identity.request_uri.edition,
                Some(_) => identity.request_uri.edition + 1,
            };

            let file = build_identity_file(&engine, &identity, &nickname)?;
            let payload = encode_identity_file(&file)?;
            let keypair = IdentityKeypair::from_insert_uri(&own.insert_uri);
            let signature = keypair.sign(&payload);
            let insert_uri = own.insert_uri.with_edition(next_edition);

            match self.network.insert(
                &insert_uri,
                &keypair.verifying_key_bytes(),
                &payload,
                &signature,
            ) {
                Ok(()) => {
                    engine.record_insert(&identity.id, next_edition)?;
                    self.stats.lock().expect("stats lock poisoned").inserted += 1;
                }
                Err(InsertError::Collision) => {
                    // Someone (probably ourselves, before a restore) already
                    // owns this edition; the fetcher will catch up and the
                    // next cycle tries the edition after it.
                    warn!(identity = %identity.id, edition = next_edition, "insert collision");
                    self.stats.lock().expect("stats lock poisoned").collisions += 1;
                }
                Err(e) => {
                    warn!(identity = %identity.id, error = %e, "insert failed");
                    self.stats.lock().expect("stats lock poisoned").failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// The owner changed data since the last insert, or the identity has been
/// unchanged long enough that a re-insert proves liveness.
fn needs_insert(identity: &Identity, last_insert: Option<Timestamp>, now: Timestamp) -> bool {
    match last_insert {
        None => true,
        Some(last) => {
            identity.last_changed > last
                || now - last > MAX_UNCHANGED_TIME_BEFORE_REINSERT_SECS
        }
    }
}

/// Rapid edits coalesce: wait until the data has been stable for
/// `MIN_DELAY_BEFORE_INSERT`, but never defer longer than
/// `MAX_DELAY_BEFORE_INSERT` after the previous insert.
fn delay_elapsed(identity: &Identity, last_insert: Option<Timestamp>, now: Timestamp) -> bool {
    match last_insert {
        None => true,
        Some(last) => {
            now - identity.last_changed >= MIN_DELAY_BEFORE_INSERT_SECS
                || now - last >= MAX_DELAY_BEFORE_INSERT_SECS
        }
    }
}

/// Assemble the publishable document: attributes plus the current trust
/// list, each trustee's URI carrying its newest known edition as a hint
/// for other nodes.
fn build_identity_file(
    engine: &ScoreEngine,
    identity: &Identity,
    nickname: &str,
) -> Result<IdentityFile, WotError> {
    let mut trust_list = Vec::new();
    if identity.publishes_trust_list {
        for trust in engine.trusts_of(&identity.id)? {
            let trustee = engine.identity(&trust.trustee)?;
            trust_list.push(TrustListEntry {
                trustee_uri: trustee
                    .request_uri
                    .with_edition(trustee.latest_edition_hint),
                value: trust.value,
                comment: trust.comment.clone(),
            });
        }
    }
    Ok(IdentityFile {
        nickname: nickname.to_string(),
        publishes_trust_list: identity.publishes_trust_list,
        contexts: identity.contexts.clone(),
        properties: identity.properties.clone(),
        trust_list,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::clock::ManualClock;
    use weft_graph::{NullScheduler, SubscriptionManager};
    use weft_net::MemoryNetwork;
    use weft_store::GraphDb;
    use weft_xml::decode_identity_file;

    struct Rig {
        engine: Arc<tokio::sync::Mutex<ScoreEngine>>,
        network: Arc<MemoryNetwork>,
        clock: ManualClock,
        inserter: IdentityInserter,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn rig(tag: &str) -> Rig {
        let base = std::env::temp_dir().join(format!("weft_insert_{}_{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let clock = ManualClock::at(1_000_000);
        let db = Arc::new(GraphDb::open(&base).unwrap());
        let engine = Arc::new(tokio::sync::Mutex::new(ScoreEngine::new(
            db,
            Arc::new(clock.clone()),
            Arc::new(NullScheduler),
            Arc::new(SubscriptionManager::new()),
            false,
        )));
        let network = Arc::new(MemoryNetwork::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inserter = IdentityInserter::new(
            Arc::clone(&engine),
            Arc::clone(&network) as Arc<dyn ContentNetwork>,
            Arc::new(clock.clone()),
            shutdown_rx,
        );
        Rig {
            engine,
            network,
            clock,
            inserter,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn first_insert_publishes_edition_zero() {
        let r = rig("first");
        let kp = IdentityKeypair::generate();
        let o1 = {
            let mut engine = r.engine.lock().await;
            engine.create_own_identity(&kp, "o1", true).unwrap()
        };

        r.inserter.insert_due().await.unwrap();

        assert_eq!(r.network.latest_edition(&o1.id), Some(0));
        let engine = r.engine.lock().await;
        let identity = engine.identity(&o1.id).unwrap();
        assert_eq!(identity.request_uri.edition, 0);
        assert!(identity.own.as_ref().unwrap().last_insert.is_some());
    }

    #[tokio::test]
    async fn edits_coalesce_until_the_min_delay() {
        let r = rig("coalesce");
        let kp = IdentityKeypair::generate();
        let o1 = {
            let mut engine = r.engine.lock().await;
            engine.create_own_identity(&kp, "o1", true).unwrap()
        };
        r.inserter.insert_due().await.unwrap();
        assert_eq!(r.network.latest_edition(&o1.id), Some(0));

        // An edit right after the insert is held back.
        r.clock.advance(10);
        {
            let mut engine = r.engine.lock().await;
            engine.add_own_context(&o1.id, "Chat").unwrap();
        }
        r.inserter.insert_due().await.unwrap();
        assert_eq!(r.network.latest_edition(&o1.id), Some(0), "deferred");

        // Once the data has been stable for the minimum delay, it goes out.
        r.clock.advance(MIN_DELAY_BEFORE_INSERT_SECS + 1);
        r.inserter.insert_due().await.unwrap();
        assert_eq!(r.network.latest_edition(&o1.id), Some(1));

        let engine = r.engine.lock().await;
        assert_eq!(engine.identity(&o1.id).unwrap().request_uri.edition, 1);
    }

    #[tokio::test]
    async fn unchanged_identity_reinserts_for_liveness() {
        let r = rig("liveness");
        let kp = IdentityKeypair::generate();
        let o1 = {
            let mut engine = r.engine.lock().await;
            engine.create_own_identity(&kp, "o1", true).unwrap()
        };
        r.inserter.insert_due().await.unwrap();

        r.clock.advance(MAX_UNCHANGED_TIME_BEFORE_REINSERT_SECS + 1);
        r.inserter.insert_due().await.unwrap();
        assert_eq!(r.network.latest_edition(&o1.id), Some(1));
    }

    #[tokio::test]
    async fn collision_leaves_edition_unchanged() {
        let r = rig("collision");
        let kp = IdentityKeypair::generate();
        let o1 = {
            let mut engine = r.engine.lock().await;
            engine.create_own_identity(&kp, "o1", true).unwrap()
        };
        r.inserter.insert_due().await.unwrap();

        // Edition 1 already exists in the network.
        r.network.publish(&kp, 1, b"foreign edition");
        r.clock.advance(10);
        {
            let mut engine = r.engine.lock().await;
            engine.add_own_context(&o1.id, "Chat").unwrap();
        }
        r.clock.advance(MIN_DELAY_BEFORE_INSERT_SECS + 1);
        r.inserter.insert_due().await.unwrap();

        let stats = *r.inserter.statistics_handle().lock().unwrap();
        assert_eq!(stats.collisions, 1);
        let engine = r.engine.lock().await;
        assert_eq!(
            engine.identity(&o1.id).unwrap().request_uri.edition,
            0,
            "edition untouched after collision"
        );
    }

    #[tokio::test]
    async fn published_file_carries_trust_list_with_hints() {
        let r = rig("payload");
        let kp = IdentityKeypair::generate();
        let (o1, _a) = {
            let mut engine = r.engine.lock().await;
            let o1 = engine.create_own_identity(&kp, "o1", true).unwrap();
            let a_uri = weft_core::uri::RequestUri {
                routing_key: [7u8; 32],
                crypto_key: [8u8; 32],
                settings: "AQACAAE".into(),
                edition: 0,
            };
            let a = engine.set_trust_by_uri(&o1.id, &a_uri, 75, "friend").unwrap();
            (o1, a)
        };

        r.inserter.insert_due().await.unwrap();
        assert_eq!(r.network.latest_edition(&o1.id), Some(0));

        let outcome = r.network.fetch(&kp.request_uri(0)).await.unwrap();
        let weft_net::FetchOutcome::Success(bytes) = outcome else {
            panic!("inserted edition must be fetchable");
        };
        let file = decode_identity_file(&bytes).unwrap().unwrap();
        assert_eq!(file.nickname, "o1");
        assert_eq!(file.trust_list.len(), 1);
        assert_eq!(file.trust_list[0].value, 75);
    }
}
