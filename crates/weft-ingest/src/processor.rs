//! Single-threaded consumer of the identity-file queue.
//!
//! After a queue wakeup the processor sleeps `PROCESSING_DELAY` — the
//! window in which the queue may still deduplicate superseded editions —
//! then drains the queue sequentially, one engine transaction per file.
//! Non-deduplicating queues are drained without delay. The drain loop
//! checks the shutdown signal between files and leaves the remainder
//! queued; shutdown then waits for the task to exit, because interrupting
//! an import mid-transaction could corrupt the derived scores.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use weft_core::constants::PROCESSING_DELAY_SECS;
use weft_core::error::WotError;
use weft_graph::ScoreEngine;
use weft_xml::decode_identity_file;

use crate::queue::{FetchedFile, IdentityFileQueue};

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessorStatistics {
    pub processed: u64,
    pub failed: u64,
    pub total_processing: Duration,
}

pub struct IdentityFileProcessor {
    queue: Arc<IdentityFileQueue>,
    engine: Arc<tokio::sync::Mutex<ScoreEngine>>,
    delay: Duration,
    shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ProcessorStatistics>>,
}

impl IdentityFileProcessor {
    pub fn new(
        queue: Arc<IdentityFileQueue>,
        engine: Arc<tokio::sync::Mutex<ScoreEngine>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let delay = if queue.deduplicates() {
            Duration::from_secs(PROCESSING_DELAY_SECS as u64)
        } else {
            Duration::ZERO
        };
        Self {
            queue,
            engine,
            delay,
            shutdown,
            stats: Arc::new(Mutex::new(ProcessorStatistics::default())),
        }
    }

    pub fn statistics_handle(&self) -> Arc<Mutex<ProcessorStatistics>> {
        Arc::clone(&self.stats)
    }

    pub async fn run(mut self) {
        info!(delay_secs = self.delay.as_secs(), "identity file processor started");
        loop {
            // A queue populated before we got here still needs draining.
            if self.queue.is_empty() {
                tokio::select! {
                    _ = self.queue.wakeup() => {}
                    _ = self.shutdown.changed() => break,
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.shutdown.changed() => break,
            }
            if self.drain().await.is_break() {
                break;
            }
        }
        info!("identity file processor stopped");
    }

    async fn drain(&mut self) -> std::ops::ControlFlow<()> {
        loop {
            if *self.shutdown.borrow() {
                return std::ops::ControlFlow::Break(());
            }
            let Some(file) = self.queue.poll() else {
                return std::ops::ControlFlow::Continue(());
            };
            let started = Instant::now();
            match self.process_one(&file).await {
                Ok(()) => {
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.processed += 1;
                    stats.total_processing += started.elapsed();
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal error while processing identity file");
                    return std::ops::ControlFlow::Break(());
                }
                Err(e) => {
                    warn!(uri = %file.uri, error = %e, "identity file rejected");
                    let mut stats = self.stats.lock().expect("stats lock poisoned");
                    stats.failed += 1;
                    stats.total_processing += started.elapsed();
                }
            }
            // One file per transaction; give other tasks a turn in between.
            tokio::task::yield_now().await;
        }
    }

    async fn process_one(&self, file: &FetchedFile) -> Result<(), WotError> {
        let id = file.uri.derived_id();
        let edition = file.uri.edition;
        let mut engine = self.engine.lock().await;

        match decode_identity_file(&file.bytes) {
            Ok(Some(parsed)) => {
                engine.begin_trust_list_import()?;
                match engine.import_trust_list(&id, edition, &parsed) {
                    Ok(()) => engine.finish_trust_list_import(),
                    Err(e) => {
                        engine.abort_trust_list_import();
                        if e.is_fatal() {
                            return Err(e);
                        }
                        // Remote data violated a constraint; the edition
                        // still advances so we do not retry in a loop.
                        engine.mark_parsing_failed(&id, edition)?;
                        Err(e)
                    }
                }
            }
            Ok(None) => {
                debug!(identity = %id, edition, "unknown format version discarded");
                Ok(())
            }
            Err(e) => {
                engine.mark_parsing_failed(&id, edition)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use weft_core::clock::ManualClock;
    use weft_crypto::IdentityKeypair;
    use weft_graph::{NullScheduler, SubscriptionManager};
    use weft_store::GraphDb;
    use weft_xml::{encode_identity_file, IdentityFile, TrustListEntry};

    fn test_setup(
        tag: &str,
    ) -> (
        Arc<IdentityFileQueue>,
        Arc<tokio::sync::Mutex<ScoreEngine>>,
    ) {
        let base = std::env::temp_dir().join(format!("weft_proc_{}_{tag}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let clock = Arc::new(ManualClock::at(0));
        let queue =
            Arc::new(IdentityFileQueue::open(base.join("spool"), false, clock.clone()).unwrap());
        let db = Arc::new(GraphDb::open(base.join("db")).unwrap());
        let engine = ScoreEngine::new(
            db,
            clock,
            Arc::new(NullScheduler),
            Arc::new(SubscriptionManager::new()),
            true,
        );
        (queue, Arc::new(tokio::sync::Mutex::new(engine)))
    }

    fn remote_uri(b: u8, edition: u64) -> weft_core::uri::RequestUri {
        weft_core::uri::RequestUri {
            routing_key: [b; 32],
            crypto_key: [b; 32],
            settings: "AQACAAE".into(),
            edition,
        }
    }

    #[tokio::test]
    async fn drains_queue_and_imports() {
        let (queue, engine) = test_setup("import");

        // An own identity trusting `alice` makes her file importable.
        let kp = IdentityKeypair::generate();
        let alice_uri = remote_uri(1, 1);
        let alice = {
            let mut engine = engine.lock().await;
            let o1 = engine.create_own_identity(&kp, "o1", true).unwrap();
            engine
                .set_trust_by_uri(&o1.id, &alice_uri.with_edition(0), 100, "")
                .unwrap()
        };

        let payload = encode_identity_file(&IdentityFile {
            nickname: "alice".into(),
            publishes_trust_list: true,
            contexts: vec![],
            properties: BTreeMap::new(),
            trust_list: vec![TrustListEntry {
                trustee_uri: remote_uri(2, 0),
                value: 40,
                comment: String::new(),
            }],
        })
        .unwrap();
        queue.enqueue(&alice_uri, &payload).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut processor = IdentityFileProcessor::new(queue.clone(), engine.clone(), shutdown_rx);
        processor.delay = Duration::ZERO;
        let stats = processor.statistics_handle();
        let join = tokio::spawn(processor.run());

        // Wait until the file has been consumed.
        for _ in 0..200 {
            if stats.lock().unwrap().processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.lock().unwrap().processed, 1);
        assert!(queue.is_empty());

        {
            let engine = engine.lock().await;
            let identity = engine.identity(&alice).unwrap();
            assert_eq!(identity.nickname.as_deref(), Some("alice"));
            assert_eq!(identity.request_uri.edition, 1);
            assert_eq!(engine.trusts_of(&alice).unwrap().len(), 1);
        }

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_file_marks_parsing_failed() {
        let (queue, engine) = test_setup("failed");

        let kp = IdentityKeypair::generate();
        let alice_uri = remote_uri(3, 2);
        let alice = {
            let mut engine = engine.lock().await;
            let o1 = engine.create_own_identity(&kp, "o1", true).unwrap();
            engine
                .set_trust_by_uri(&o1.id, &alice_uri.with_edition(0), 100, "")
                .unwrap()
        };
        queue.enqueue(&alice_uri, b"<WebOfTrust Version=\"1\"><broken").unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut processor = IdentityFileProcessor::new(queue.clone(), engine.clone(), shutdown_rx);
        processor.delay = Duration::ZERO;
        let stats = processor.statistics_handle();
        let join = tokio::spawn(processor.run());

        for _ in 0..200 {
            if stats.lock().unwrap().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.lock().unwrap().failed, 1);

        {
            let engine = engine.lock().await;
            let identity = engine.identity(&alice).unwrap();
            assert_eq!(
                identity.fetch_state,
                weft_core::identity::FetchState::ParsingFailed
            );
            // The edition advanced anyway, so this edition is not retried.
            assert_eq!(identity.request_uri.edition, 2);
        }

        shutdown_tx.send(true).unwrap();
        join.await.unwrap();
    }
}
