use serde::{Deserialize, Serialize};

use crate::constants::{CAPACITY_TABLE, MAX_RANK};
use crate::types::{IdentityId, ScoreId};

/// Derived trust standing of `target` seen from the tree of `owner`.
///
/// Scores are pure derived state: they are created and destroyed by the
/// engine purely as a function of the current identity and trust sets, and
/// never persisted across a from-scratch recomputation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub owner: IdentityId,
    pub target: IdentityId,
    /// Capacity-weighted trust sum; the owner's direct trust value when a
    /// direct edge exists. The owner's score for itself is `i32::MAX`.
    pub value: i32,
    /// Shortest rank-conferring path length from the owner; [`MAX_RANK`]
    /// when only hostile edges reach the target.
    pub rank: u32,
    /// Rank-indexed attenuation: how much this identity's own opinions
    /// count when scoring identities further out.
    pub capacity: u8,
}

impl Score {
    /// The seed score every own identity holds for itself.
    pub fn own_self_score(owner: IdentityId) -> Self {
        Self {
            owner,
            target: owner,
            value: i32::MAX,
            rank: 0,
            capacity: 100,
        }
    }

    pub fn id(&self) -> ScoreId {
        ScoreId::new(self.owner, self.target)
    }

    /// Whether this score alone makes the target worth downloading.
    pub fn should_maybe_fetch(&self) -> bool {
        self.value >= 0 || self.capacity > 0
    }
}

/// Capacity for a rank: table lookup clamped to the last entry, 0 for the
/// hostile sentinel, and forced to 0 when the owner directly distrusts the
/// target (explicit distrust always wins).
pub fn capacity_for_rank(rank: u32, directly_distrusted: bool) -> u8 {
    if directly_distrusted || rank == MAX_RANK {
        return 0;
    }
    let idx = (rank as usize).min(CAPACITY_TABLE.len() - 1);
    CAPACITY_TABLE[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_table_by_rank() {
        assert_eq!(capacity_for_rank(0, false), 100);
        assert_eq!(capacity_for_rank(1, false), 40);
        assert_eq!(capacity_for_rank(2, false), 16);
        assert_eq!(capacity_for_rank(3, false), 6);
        assert_eq!(capacity_for_rank(4, false), 2);
        assert_eq!(capacity_for_rank(5, false), 1);
        assert_eq!(capacity_for_rank(17, false), 1, "clamped to last entry");
        assert_eq!(capacity_for_rank(MAX_RANK, false), 0);
    }

    #[test]
    fn direct_distrust_overrides_rank() {
        assert_eq!(capacity_for_rank(1, true), 0);
    }

    #[test]
    fn self_score_is_fetchable() {
        let s = Score::own_self_score(IdentityId::from_bytes([1u8; 32]));
        assert!(s.should_maybe_fetch());
        assert_eq!((s.value, s.rank, s.capacity), (i32::MAX, 0, 100));
    }

    #[test]
    fn hostile_score_with_zero_capacity_is_not_fetchable() {
        let owner = IdentityId::from_bytes([1u8; 32]);
        let target = IdentityId::from_bytes([2u8; 32]);
        let s = Score {
            owner,
            target,
            value: -1,
            rank: 1,
            capacity: 0,
        };
        assert!(!s.should_maybe_fetch());
    }
}
