//! Identity entities.
//!
//! An [`Identity`] is a remote user known from the network; an identity with
//! [`OwnIdentityData`] attached is locally owned and can publish. Own
//! identities whose fetch state is not `Fetched` are *in restore*: their
//! historical editions are being downloaded to rebuild local state from the
//! keypair alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{
    MAX_CONTEXT_COUNT, MAX_CONTEXT_NAME_LEN, MAX_NICKNAME_LEN, MAX_PROPERTY_COUNT,
    MAX_PROPERTY_KEY_LEN, MAX_PROPERTY_VALUE_BYTES,
};
use crate::error::WotError;
use crate::types::{Edition, IdentityId, Timestamp};
use crate::uri::{InsertUri, RequestUri};

// ── FetchState ───────────────────────────────────────────────────────────────

/// State machine of the identity's current edition.
///
/// `NotFetched → Fetched` on successful parse, `NotFetched → ParsingFailed`
/// on malformed data. Both non-initial states return to `NotFetched` via
/// [`Identity::mark_for_refetch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    NotFetched,
    Fetched,
    ParsingFailed,
}

// ── OwnIdentityData ──────────────────────────────────────────────────────────

/// Extra state carried by a locally-owned identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnIdentityData {
    /// Private publish URI (same keypair as the request URI).
    pub insert_uri: InsertUri,
    /// When this identity's data was last inserted into the network.
    pub last_insert: Option<Timestamp>,
}

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Fetch URI carrying the current edition.
    pub request_uri: RequestUri,
    pub fetch_state: FetchState,
    /// Highest edition any other identity has claimed exists. Always
    /// ≥ `request_uri.edition`.
    pub latest_edition_hint: Edition,
    /// Immutable once set.
    pub nickname: Option<String>,
    pub publishes_trust_list: bool,
    /// Ordered set, no duplicates.
    pub contexts: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub last_fetched: Option<Timestamp>,
    pub last_changed: Timestamp,
    /// Present iff this identity is locally owned.
    pub own: Option<OwnIdentityData>,
}

impl Identity {
    /// A freshly-learned remote identity, not yet fetched.
    pub fn new_remote(request_uri: RequestUri, now: Timestamp) -> Self {
        let id = request_uri.derived_id();
        let hint = request_uri.edition;
        Self {
            id,
            request_uri,
            fetch_state: FetchState::NotFetched,
            latest_edition_hint: hint,
            nickname: None,
            publishes_trust_list: false,
            contexts: Vec::new(),
            properties: BTreeMap::new(),
            last_fetched: None,
            last_changed: now,
            own: None,
        }
    }

    /// A locally-created own identity. Created `Fetched` so the inserter may
    /// publish immediately without a pointless self-download.
    pub fn new_own(
        request_uri: RequestUri,
        insert_uri: InsertUri,
        nickname: &str,
        publishes_trust_list: bool,
        now: Timestamp,
    ) -> Result<Self, WotError> {
        validate_nickname(nickname)?;
        let id = request_uri.derived_id();
        Ok(Self {
            id,
            request_uri,
            fetch_state: FetchState::Fetched,
            latest_edition_hint: 0,
            nickname: Some(nickname.to_string()),
            publishes_trust_list,
            contexts: Vec::new(),
            properties: BTreeMap::new(),
            last_fetched: None,
            last_changed: now,
            own: Some(OwnIdentityData {
                insert_uri,
                last_insert: None,
            }),
        })
    }

    pub fn is_own(&self) -> bool {
        self.own.is_some()
    }

    /// An own identity being rebuilt from its keypair.
    pub fn in_restore(&self) -> bool {
        self.is_own() && self.fetch_state != FetchState::Fetched
    }

    // ── Attribute mutation ───────────────────────────────────────────────────

    /// Set the nickname. Fails once a different nickname has been observed.
    pub fn set_nickname(&mut self, nickname: &str) -> Result<(), WotError> {
        validate_nickname(nickname)?;
        match &self.nickname {
            Some(existing) if existing != nickname => Err(WotError::NicknameChanged),
            Some(_) => Ok(()),
            None => {
                self.nickname = Some(nickname.to_string());
                Ok(())
            }
        }
    }

    pub fn add_context(&mut self, name: &str) -> Result<(), WotError> {
        validate_context_name(name)?;
        if self.contexts.iter().any(|c| c == name) {
            return Ok(());
        }
        if self.contexts.len() >= MAX_CONTEXT_COUNT {
            return Err(WotError::TooManyContexts {
                max: MAX_CONTEXT_COUNT,
            });
        }
        self.contexts.push(name.to_string());
        Ok(())
    }

    pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), WotError> {
        validate_property(key, value)?;
        if !self.properties.contains_key(key) && self.properties.len() >= MAX_PROPERTY_COUNT {
            return Err(WotError::TooManyProperties {
                max: MAX_PROPERTY_COUNT,
            });
        }
        self.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    // ── Edition bookkeeping ──────────────────────────────────────────────────

    /// Advance the current edition, keeping the hint invariant
    /// `latest_edition_hint ≥ request_uri.edition`.
    pub fn set_edition(&mut self, edition: Edition) {
        self.request_uri.edition = edition;
        if let Some(own) = &mut self.own {
            own.insert_uri.edition = edition;
        }
        if self.latest_edition_hint < edition {
            self.latest_edition_hint = edition;
        }
    }

    /// Raise the hint; returns whether it actually increased.
    pub fn update_edition_hint(&mut self, hint: Edition) -> bool {
        if hint > self.latest_edition_hint {
            self.latest_edition_hint = hint;
            true
        } else {
            false
        }
    }

    /// Reset to `NotFetched` so the downloaders re-request the identity.
    ///
    /// When the state was `Fetched`, the request edition is decremented by
    /// one (floor 0) to force at least one actual re-download; a no-op when
    /// already `NotFetched`. Returns whether anything changed.
    pub fn mark_for_refetch(&mut self) -> bool {
        match self.fetch_state {
            FetchState::NotFetched => false,
            FetchState::Fetched => {
                self.fetch_state = FetchState::NotFetched;
                let e = self.request_uri.edition;
                self.request_uri.edition = e.saturating_sub(1);
                true
            }
            FetchState::ParsingFailed => {
                self.fetch_state = FetchState::NotFetched;
                true
            }
        }
    }
}

// ── Attribute validation ─────────────────────────────────────────────────────

/// Nicknames: 1–30 chars, letters, digits, `.`, `_`, `-` and inner spaces.
pub fn validate_nickname(nickname: &str) -> Result<(), WotError> {
    if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_LEN {
        return Err(WotError::InvalidNickname(format!(
            "length must be 1..={MAX_NICKNAME_LEN}"
        )));
    }
    if nickname.starts_with(' ') || nickname.ends_with(' ') {
        return Err(WotError::InvalidNickname(
            "leading/trailing space".to_string(),
        ));
    }
    if let Some(c) = nickname
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ')))
    {
        return Err(WotError::InvalidNickname(format!("illegal char {c:?}")));
    }
    Ok(())
}

/// Contexts: 1–32 alphanumeric chars.
pub fn validate_context_name(name: &str) -> Result<(), WotError> {
    if name.is_empty()
        || name.chars().count() > MAX_CONTEXT_NAME_LEN
        || !name.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(WotError::InvalidContext(name.to_string()));
    }
    Ok(())
}

/// Property keys: 1–256 chars of alphanumeric plus dot; values ≤ 10 KiB.
pub fn validate_property(key: &str, value: &str) -> Result<(), WotError> {
    if key.is_empty()
        || key.chars().count() > MAX_PROPERTY_KEY_LEN
        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
    {
        return Err(WotError::InvalidProperty {
            key: key.to_string(),
            reason: "bad key".to_string(),
        });
    }
    if value.len() > MAX_PROPERTY_VALUE_BYTES {
        return Err(WotError::InvalidProperty {
            key: key.to_string(),
            reason: format!("value exceeds {MAX_PROPERTY_VALUE_BYTES} bytes"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(edition: Edition) -> RequestUri {
        RequestUri {
            routing_key: [9u8; 32],
            crypto_key: [8u8; 32],
            settings: "AQACAAE".into(),
            edition,
        }
    }

    #[test]
    fn nickname_is_immutable() {
        let mut id = Identity::new_remote(uri(0), 0);
        id.set_nickname("alice").unwrap();
        assert!(id.set_nickname("alice").is_ok());
        assert!(matches!(
            id.set_nickname("bob"),
            Err(WotError::NicknameChanged)
        ));
    }

    #[test]
    fn refetch_decrements_edition_only_when_fetched() {
        let mut id = Identity::new_remote(uri(5), 0);
        id.fetch_state = FetchState::Fetched;
        assert!(id.mark_for_refetch());
        assert_eq!(id.fetch_state, FetchState::NotFetched);
        assert_eq!(id.request_uri.edition, 4);

        // Already NotFetched — idempotent.
        assert!(!id.mark_for_refetch());
        assert_eq!(id.request_uri.edition, 4);

        id.fetch_state = FetchState::ParsingFailed;
        assert!(id.mark_for_refetch());
        assert_eq!(id.request_uri.edition, 4, "no decrement after parse failure");
    }

    #[test]
    fn refetch_edition_floors_at_zero() {
        let mut id = Identity::new_remote(uri(0), 0);
        id.fetch_state = FetchState::Fetched;
        id.mark_for_refetch();
        assert_eq!(id.request_uri.edition, 0);
    }

    #[test]
    fn edition_hint_never_decreases() {
        let mut id = Identity::new_remote(uri(3), 0);
        assert!(id.update_edition_hint(7));
        assert!(!id.update_edition_hint(5));
        assert_eq!(id.latest_edition_hint, 7);
    }

    #[test]
    fn set_edition_raises_hint() {
        let mut id = Identity::new_remote(uri(0), 0);
        id.set_edition(12);
        assert_eq!(id.latest_edition_hint, 12);
    }

    #[test]
    fn context_and_property_limits() {
        let mut id = Identity::new_remote(uri(0), 0);
        for i in 0..MAX_CONTEXT_COUNT {
            id.add_context(&format!("ctx{i}")).unwrap();
        }
        assert!(matches!(
            id.add_context("overflow"),
            Err(WotError::TooManyContexts { .. })
        ));
        // Re-adding an existing context is fine even at the cap.
        assert!(id.add_context("ctx0").is_ok());

        assert!(validate_property("a.b", "v").is_ok());
        assert!(validate_property("spaced key", "v").is_err());
    }
}
