//! weft-core — data model of the web of trust.
//!
//! Identities, trust edges, derived scores, identity URIs, the persistent
//! configuration record, the error taxonomy, and the clock seam. No I/O
//! lives here; the store and engine crates build on these types.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod score;
pub mod trust;
pub mod types;
pub mod uri;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Configuration;
pub use error::WotError;
pub use identity::{FetchState, Identity, OwnIdentityData};
pub use score::{capacity_for_rank, Score};
pub use trust::Trust;
pub use types::{Edition, IdentityId, ScoreId, Timestamp, TrustId, TrustValue};
pub use uri::{InsertUri, RequestUri, SEED_IDENTITIES};
