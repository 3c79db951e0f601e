use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use weft_core::types::{Edition, IdentityId};
use weft_core::uri::{InsertUri, RequestUri};
use weft_crypto::{verify_publisher, IdentityKeypair};

/// One edition delivered by a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedEdition {
    /// Request URI at the delivered edition.
    pub uri: RequestUri,
    pub bytes: Vec<u8>,
}

/// Outcome of a single-edition fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Vec<u8>),
    /// The edition does not exist; hints referring to it are bogus.
    NotFound,
    /// Routing or I/O trouble; worth retrying with backoff.
    Transient(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The edition already exists in the network; the fetcher will catch
    /// up and the caller retries with the next edition.
    Collision,
    Rejected(String),
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InsertError::Collision => write!(f, "edition collision"),
            InsertError::Rejected(reason) => write!(f, "insert rejected: {reason}"),
        }
    }
}

/// The network primitive the downloaders and the inserter drive.
///
/// All calls are non-blocking: subscriptions and fetches hand results back
/// over channels, so callers keep cancellation in their own hands.
pub trait ContentNetwork: Send + Sync {
    /// Subscribe to the identity's update stream. Editions strictly newer
    /// than `uri.edition` are delivered, the newest known one immediately.
    fn subscribe(&self, uri: &RequestUri) -> mpsc::Receiver<FetchedEdition>;

    /// Cancel the identity's subscription, if any.
    fn unsubscribe(&self, id: &IdentityId);

    /// Fetch exactly `uri.edition`.
    fn fetch(&self, uri: &RequestUri) -> oneshot::Receiver<FetchOutcome>;

    /// Publish `payload` at `uri.edition`, authenticated by the publishing
    /// keypair.
    fn insert(
        &self,
        uri: &InsertUri,
        verifying_key: &[u8; 32],
        payload: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), InsertError>;
}

// ── MemoryNetwork ────────────────────────────────────────────────────────────

struct Subscriber {
    uri: RequestUri,
    tx: mpsc::Sender<FetchedEdition>,
}

#[derive(Default)]
struct NetInner {
    documents: BTreeMap<(IdentityId, Edition), Vec<u8>>,
    latest: HashMap<IdentityId, Edition>,
    subscribers: HashMap<IdentityId, Subscriber>,
    /// Test hook: pending transient failures per identity.
    transient_failures: HashMap<IdentityId, u32>,
}

/// In-process [`ContentNetwork`]: a shared document store with immediate
/// delivery. Inserts are verified against the routing key exactly like the
/// real network would.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<NetInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an edition directly from a keypair (test convenience).
    pub fn publish(&self, keypair: &IdentityKeypair, edition: Edition, payload: &[u8]) {
        let uri = keypair.insert_uri(edition);
        let signature = keypair.sign(payload);
        self.insert(&uri, &keypair.verifying_key_bytes(), payload, &signature)
            .expect("publish in test network");
    }

    /// Make the next `count` fetches for `id` fail with a transient error.
    pub fn inject_transient_failures(&self, id: &IdentityId, count: u32) {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .transient_failures
            .insert(*id, count);
    }

    pub fn latest_edition(&self, id: &IdentityId) -> Option<Edition> {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .latest
            .get(id)
            .copied()
    }

    pub fn has_subscription(&self, id: &IdentityId) -> bool {
        self.inner
            .lock()
            .expect("network lock poisoned")
            .subscribers
            .contains_key(id)
    }
}

impl ContentNetwork for MemoryNetwork {
    fn subscribe(&self, uri: &RequestUri) -> mpsc::Receiver<FetchedEdition> {
        let id = uri.derived_id();
        let (tx, rx) = mpsc::channel(16);
        let mut inner = self.inner.lock().expect("network lock poisoned");

        // Deliver the newest known edition right away if the caller is
        // behind.
        if let Some(&latest) = inner.latest.get(&id) {
            if latest >= uri.edition {
                if let Some(bytes) = inner.documents.get(&(id, latest)) {
                    let _ = tx.try_send(FetchedEdition {
                        uri: uri.with_edition(latest),
                        bytes: bytes.clone(),
                    });
                }
            }
        }

        inner.subscribers.insert(
            id,
            Subscriber {
                uri: uri.clone(),
                tx,
            },
        );
        debug!(identity = %id, edition = uri.edition, "subscription created");
        rx
    }

    fn unsubscribe(&self, id: &IdentityId) {
        let removed = self
            .inner
            .lock()
            .expect("network lock poisoned")
            .subscribers
            .remove(id);
        if removed.is_some() {
            debug!(identity = %id, "subscription cancelled");
        }
    }

    fn fetch(&self, uri: &RequestUri) -> oneshot::Receiver<FetchOutcome> {
        let id = uri.derived_id();
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("network lock poisoned");

        let outcome = if let Some(failures) = inner.transient_failures.get_mut(&id) {
            if *failures > 0 {
                *failures -= 1;
                FetchOutcome::Transient("injected failure".to_string())
            } else {
                lookup(&inner, &id, uri.edition)
            }
        } else {
            lookup(&inner, &id, uri.edition)
        };
        let _ = tx.send(outcome);
        rx
    }

    fn insert(
        &self,
        uri: &InsertUri,
        verifying_key: &[u8; 32],
        payload: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), InsertError> {
        let keypair = IdentityKeypair::from_insert_uri(uri);
        let id = keypair.identity_id();
        verify_publisher(id.as_bytes(), verifying_key, payload, signature)
            .map_err(|e| InsertError::Rejected(e.to_string()))?;

        let mut inner = self.inner.lock().expect("network lock poisoned");
        if inner.documents.contains_key(&(id, uri.edition)) {
            return Err(InsertError::Collision);
        }
        inner.documents.insert((id, uri.edition), payload.to_vec());
        let latest = inner.latest.entry(id).or_insert(uri.edition);
        if uri.edition > *latest {
            *latest = uri.edition;
        }

        // Push to the live subscriber if it is behind this edition.
        if let Some(subscriber) = inner.subscribers.get(&id) {
            if uri.edition >= subscriber.uri.edition {
                let _ = subscriber.tx.try_send(FetchedEdition {
                    uri: subscriber.uri.with_edition(uri.edition),
                    bytes: payload.to_vec(),
                });
            }
        }
        debug!(identity = %id, edition = uri.edition, "edition inserted");
        Ok(())
    }
}

fn lookup(inner: &NetInner, id: &IdentityId, edition: Edition) -> FetchOutcome {
    match inner.documents.get(&(*id, edition)) {
        Some(bytes) => FetchOutcome::Success(bytes.clone()),
        None => FetchOutcome::NotFound,
    }
}
