use serde::{Deserialize, Serialize};

use weft_core::types::IdentityId;

/// Fetch-scheduler commands, persisted in the store.
///
/// Engine callbacks run inside a graph transaction that may still roll
/// back, so they never touch the network directly; they stage one of these
/// rows instead. The fast-downloader scheduler drains the table under the
/// fetch-scheduler lock and reconciles live subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandAction {
    /// Subscribe to the identity's update stream (or restart an existing
    /// subscription if the identity was marked for refetch).
    StartDownload,
    /// Cancel the subscription.
    StopDownload,
}

/// One pending command per identity. Staging a new command for the same
/// identity inside one transaction replaces the previous one, which
/// collapses start-then-stop sequences into their net effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCommand {
    pub id: IdentityId,
    pub action: CommandAction,
}

impl DownloadCommand {
    pub fn start(id: IdentityId) -> Self {
        Self {
            id,
            action: CommandAction::StartDownload,
        }
    }

    pub fn stop(id: IdentityId) -> Self {
        Self {
            id,
            action: CommandAction::StopDownload,
        }
    }
}
