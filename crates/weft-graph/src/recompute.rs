//! Rank, capacity, and value derivation.
//!
//! [`compute_tree`] is the reference implementation: a BFS from one tree
//! owner over the full graph. [`compute_region`] re-derives the same result
//! for a bounded region only — the transitive out-closure of the mutated
//! trustees — by relaxation against the unchanged ranks outside the region.
//! Every incremental path must produce results identical to the reference;
//! the engine asserts this when `debug_incremental_scores` is on.
//!
//! Rank rules:
//!   - the owner has rank 0;
//!   - a direct edge from the owner confers rank 1 regardless of sign, so
//!     an explicitly distrusted identity is ranked (with capacity 0);
//!   - a non-negative edge from a positive-capacity identity of rank r
//!     confers rank r + 1;
//!   - a negative edge from a positive-capacity identity confers the
//!     hostile sentinel `MAX_RANK` when nothing better reaches the target;
//!   - zero-capacity identities confer nothing: their subtree is pruned.
//!
//! Value rules: the owner's direct trust value when a direct edge exists
//! (explicit opinion dominates), otherwise the capacity-weighted sum of
//! incoming trust values.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use weft_core::constants::MAX_RANK;
use weft_core::error::WotError;
use weft_core::score::{capacity_for_rank, Score};
use weft_core::types::{IdentityId, ScoreId, TrustId, TrustValue};
use weft_store::WriteBatch;

/// Direct trust from `owner` to `target`, if any.
fn direct_trust(
    batch: &WriteBatch,
    owner: &IdentityId,
    target: &IdentityId,
) -> Result<Option<TrustValue>, WotError> {
    Ok(batch
        .get_trust(&TrustId::new(*owner, *target))?
        .map(|t| t.value))
}

/// Full recomputation of `owner`'s score tree.
pub fn compute_tree(
    batch: &WriteBatch,
    owner: &IdentityId,
) -> Result<BTreeMap<IdentityId, Score>, WotError> {
    let mut ranks: HashMap<IdentityId, u32> = HashMap::new();
    let mut hostile: BTreeSet<IdentityId> = BTreeSet::new();
    ranks.insert(*owner, 0);

    let mut queue: VecDeque<IdentityId> = VecDeque::new();
    queue.push_back(*owner);

    while let Some(current) = queue.pop_front() {
        let rank = ranks[&current];
        let distrusted = current != *owner
            && direct_trust(batch, owner, &current)?.is_some_and(|v| v < 0);
        if capacity_for_rank(rank, distrusted) == 0 {
            // Zero capacity prunes the whole subtree.
            continue;
        }
        for trust in batch.trusts_by_truster(&current)? {
            let trustee = trust.trustee;
            if trustee == *owner {
                continue;
            }
            if current == *owner || trust.value >= 0 {
                if !ranks.contains_key(&trustee) {
                    ranks.insert(trustee, rank + 1);
                    queue.push_back(trustee);
                }
            } else {
                hostile.insert(trustee);
            }
        }
    }

    for target in hostile {
        ranks.entry(target).or_insert(MAX_RANK);
    }

    // Capacities, then values.
    let capacities: HashMap<IdentityId, u8> = {
        let mut out = HashMap::with_capacity(ranks.len());
        for (id, rank) in &ranks {
            let distrusted =
                id != owner && direct_trust(batch, owner, id)?.is_some_and(|v| v < 0);
            out.insert(*id, capacity_for_rank(*rank, distrusted));
        }
        out
    };

    let mut scores = BTreeMap::new();
    for (id, rank) in &ranks {
        if id == owner {
            scores.insert(*owner, Score::own_self_score(*owner));
            continue;
        }
        let value = score_value(batch, owner, id, |truster| {
            capacities.get(truster).copied()
        })?;
        scores.insert(
            *id,
            Score {
                owner: *owner,
                target: *id,
                value,
                rank: *rank,
                capacity: capacities[id],
            },
        );
    }
    Ok(scores)
}

/// Recompute `owner`'s scores for the out-closure of `seeds` only.
///
/// Returns the region and the new scores inside it; a region member absent
/// from the map has lost its score. Ranks outside the region cannot have
/// changed (any path through a mutated edge continues into the closure), so
/// stored scores are used as fixed sources.
pub fn compute_region(
    batch: &WriteBatch,
    owner: &IdentityId,
    seeds: &BTreeSet<IdentityId>,
) -> Result<(BTreeSet<IdentityId>, BTreeMap<IdentityId, Score>), WotError> {
    // Region: transitive out-closure of the seeds, owner excluded.
    let mut region: BTreeSet<IdentityId> = BTreeSet::new();
    let mut queue: VecDeque<IdentityId> = seeds.iter().copied().collect();
    while let Some(current) = queue.pop_front() {
        if current == *owner || !region.insert(current) {
            continue;
        }
        for trust in batch.trusts_by_truster(&current)? {
            if !region.contains(&trust.trustee) {
                queue.push_back(trust.trustee);
            }
        }
    }

    // Rank relaxation from unreachable, taking minima until a fixed point.
    // Ranks only decrease across iterations, so this terminates after at
    // most |region| + 1 passes.
    let mut ranks: HashMap<IdentityId, Option<u32>> =
        region.iter().map(|id| (*id, None)).collect();
    loop {
        let mut changed = false;
        for id in &region {
            let mut best: Option<u32> = None;
            for trust in batch.trusts_by_trustee(id)? {
                let truster = trust.truster;
                let candidate = if truster == *owner {
                    // Direct owner edges always rank, any sign.
                    Some(1)
                } else {
                    let truster_info = if region.contains(&truster) {
                        ranks[&truster].map(|rank| {
                            let distrusted = direct_trust(batch, owner, &truster)
                                .ok()
                                .flatten()
                                .is_some_and(|v| v < 0);
                            (rank, capacity_for_rank(rank, distrusted))
                        })
                    } else {
                        batch
                            .get_score(&ScoreId::new(*owner, truster))?
                            .map(|s| (s.rank, s.capacity))
                    };
                    match truster_info {
                        Some((_, 0)) | None => None,
                        Some((rank, _)) if trust.value >= 0 => Some(rank.saturating_add(1)),
                        Some(_) => Some(MAX_RANK),
                    }
                };
                best = match (best, candidate) {
                    (None, c) => c,
                    (b, None) => b,
                    (Some(a), Some(b)) => Some(a.min(b)),
                };
            }
            if best != ranks[id] {
                ranks.insert(*id, best);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Capacity resolver covering both region members and fixed outsiders.
    let capacity_of = |truster: &IdentityId| -> Option<u8> {
        if truster == owner {
            return Some(100);
        }
        if region.contains(truster) {
            let rank = ranks[truster]?;
            let distrusted = direct_trust(batch, owner, truster)
                .ok()
                .flatten()
                .is_some_and(|v| v < 0);
            return Some(capacity_for_rank(rank, distrusted));
        }
        batch
            .get_score(&ScoreId::new(*owner, *truster))
            .ok()
            .flatten()
            .map(|s| s.capacity)
    };

    let mut scores = BTreeMap::new();
    for id in &region {
        let Some(rank) = ranks[id] else {
            continue; // Unreachable: the stored score, if any, is removed.
        };
        let distrusted = direct_trust(batch, owner, id)?.is_some_and(|v| v < 0);
        let capacity = capacity_for_rank(rank, distrusted);
        let value = score_value(batch, owner, id, &capacity_of)?;
        scores.insert(
            *id,
            Score {
                owner: *owner,
                target: *id,
                value,
                rank,
                capacity,
            },
        );
    }
    Ok((region, scores))
}

/// Score value of `target`: the owner's direct opinion if one exists,
/// otherwise the capacity-weighted sum over incoming edges.
pub fn score_value<F>(
    batch: &WriteBatch,
    owner: &IdentityId,
    target: &IdentityId,
    capacity_of: F,
) -> Result<i32, WotError>
where
    F: Fn(&IdentityId) -> Option<u8>,
{
    if let Some(direct) = direct_trust(batch, owner, target)? {
        return Ok(direct as i32);
    }
    let mut sum = 0i32;
    for trust in batch.trusts_by_trustee(target)? {
        let capacity = if trust.truster == *owner {
            100
        } else {
            capacity_of(&trust.truster).unwrap_or(0)
        };
        if capacity > 0 {
            sum += capacity as i32 * trust.value as i32 / 100;
        }
    }
    Ok(sum)
}

/// Value recomputation for one already-ranked target, using stored
/// capacities. Valid only when no rank or capacity changed anywhere.
pub fn recompute_value_only(
    batch: &WriteBatch,
    owner: &IdentityId,
    target: &IdentityId,
) -> Result<Option<i32>, WotError> {
    if batch.get_score(&ScoreId::new(*owner, *target))?.is_none() {
        return Ok(None);
    }
    let value = score_value(batch, owner, target, |truster| {
        batch
            .get_score(&ScoreId::new(*owner, *truster))
            .ok()
            .flatten()
            .map(|s| s.capacity)
    })?;
    Ok(Some(value))
}
