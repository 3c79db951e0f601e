//! Change notifications for local subscribers.
//!
//! Mutating transactions stage one entry per entity change; the engine
//! publishes them strictly after commit, in commit order, or discards them
//! on rollback. Each entity carries a monotonically increasing version so a
//! resyncing subscriber can detect gaps. Versions are only consumed by
//! published notifications — a rolled-back transaction leaves no hole.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeDomain {
    Identity,
    Trust,
    Score,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeNotification {
    pub domain: ChangeDomain,
    /// Entity id (identity id, or `truster@trustee` / `owner@target`).
    pub id: String,
    pub old_version: u64,
    pub new_version: u64,
}

struct Inner {
    versions: HashMap<(ChangeDomain, String), u64>,
    pending: Vec<(ChangeDomain, String)>,
}

pub struct SubscriptionManager {
    inner: Mutex<Inner>,
    tx: broadcast::Sender<ChangeNotification>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                versions: HashMap::new(),
                pending: Vec::new(),
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.tx.subscribe()
    }

    /// Record a change inside the current transaction.
    pub fn stage(&self, domain: ChangeDomain, id: String) {
        let mut inner = self.inner.lock().expect("subscription lock poisoned");
        inner.pending.push((domain, id));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("subscription lock poisoned").pending.len()
    }

    /// Deliver everything staged, in stage order. Called after commit.
    pub fn publish_pending(&self) {
        let mut inner = self.inner.lock().expect("subscription lock poisoned");
        let pending = std::mem::take(&mut inner.pending);
        for (domain, id) in pending {
            let version = inner.versions.entry((domain, id.clone())).or_insert(0);
            let old_version = *version;
            *version += 1;
            let new_version = *version;
            // A send error only means there is no subscriber right now.
            let _ = self.tx.send(ChangeNotification {
                domain,
                id,
                old_version,
                new_version,
            });
        }
    }

    /// Drop everything staged. Called on rollback.
    pub fn discard_pending(&self) {
        self.inner.lock().expect("subscription lock poisoned").pending.clear();
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
