use serde::{Deserialize, Serialize};

use crate::constants::{MAX_TRUST_COMMENT_LEN, MAX_TRUST_VALUE, MIN_TRUST_VALUE};
use crate::error::WotError;
use crate::types::{Edition, IdentityId, TrustId, TrustValue};

/// A directed numeric opinion from one identity about another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    pub truster: IdentityId,
    pub trustee: IdentityId,
    /// Opinion in [-100, +100]. Negative means distrust.
    pub value: TrustValue,
    pub comment: String,
    /// The truster's trust-list edition at which this edge was last
    /// observed. Edges older than the newest imported edition are removals.
    pub truster_edition: Edition,
}

impl Trust {
    pub fn new(
        truster: IdentityId,
        trustee: IdentityId,
        value: TrustValue,
        comment: &str,
        truster_edition: Edition,
    ) -> Result<Self, WotError> {
        if truster == trustee {
            return Err(WotError::SelfTrust);
        }
        validate_trust_value(value as i16)?;
        if comment.chars().count() > MAX_TRUST_COMMENT_LEN {
            return Err(WotError::CommentTooLong {
                max: MAX_TRUST_COMMENT_LEN,
            });
        }
        Ok(Self {
            truster,
            trustee,
            value,
            comment: comment.to_string(),
            truster_edition,
        })
    }

    pub fn id(&self) -> TrustId {
        TrustId::new(self.truster, self.trustee)
    }

    /// Sign class of the edge: non-negative edges confer rank, negative
    /// edges only ever confer the hostile sentinel.
    pub fn is_positive(&self) -> bool {
        self.value >= 0
    }
}

/// Range check shared with XML decoding, which sees wider integers.
pub fn validate_trust_value(value: i16) -> Result<(), WotError> {
    if !(MIN_TRUST_VALUE as i16..=MAX_TRUST_VALUE as i16).contains(&value) {
        return Err(WotError::TrustValueOutOfRange { got: value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> IdentityId {
        IdentityId::from_bytes([b; 32])
    }

    #[test]
    fn rejects_self_trust() {
        assert!(matches!(
            Trust::new(id(1), id(1), 50, "", 0),
            Err(WotError::SelfTrust)
        ));
    }

    #[test]
    fn rejects_out_of_range_value() {
        assert!(validate_trust_value(101).is_err());
        assert!(validate_trust_value(-101).is_err());
        assert!(validate_trust_value(-100).is_ok());
        assert!(validate_trust_value(100).is_ok());
    }

    #[test]
    fn rejects_oversized_comment() {
        let long = "x".repeat(257);
        assert!(matches!(
            Trust::new(id(1), id(2), 0, &long, 0),
            Err(WotError::CommentTooLong { .. })
        ));
    }
}
