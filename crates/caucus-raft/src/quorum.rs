//! Majority-subset enumeration over the known cluster members.
//!
//! The quorum is the set of *every* subset whose size is a strict majority,
//! not just the minimal ones: commit certification checks that the set of
//! agreeing nodes exactly equals one of these subsets, while vote counting
//! checks that some subset is contained in the granted votes.
//!
//! Enumeration is `2^N` over the member count. That is acceptable for the
//! small, mostly static clusters this crate targets and is an explicit
//! scalability boundary, not a defect.

use crate::types::NodeId;
use std::collections::{BTreeSet, HashSet};

/// All strict-majority subsets of the known cluster members.
#[derive(Debug, Clone, Default)]
pub struct Quorum {
    sets: HashSet<BTreeSet<NodeId>>,
}

impl Quorum {
    /// Enumerate every subset S of `nodes` with `|S| * 2 > |nodes|`.
    ///
    /// An empty input yields the degenerate quorum containing only the empty
    /// set, so callers never observe "no quorum exists at all".
    pub fn enumerate<'a>(nodes: impl IntoIterator<Item = &'a NodeId>) -> Self {
        let members: Vec<NodeId> = nodes.into_iter().copied().collect();
        let n = members.len();

        if n == 0 {
            let mut sets = HashSet::new();
            sets.insert(BTreeSet::new());
            return Self { sets };
        }

        let mut sets = HashSet::new();
        for mask in 0u64..(1u64 << n) {
            let subset: BTreeSet<NodeId> = (0..n)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| members[i])
                .collect();

            if subset.len() * 2 > n {
                sets.insert(subset);
            }
        }

        Self { sets }
    }

    /// True when `agree` exactly equals one of the majority subsets.
    ///
    /// Used for commit certification: the agreeing set must *be* a majority
    /// set, not merely contain one.
    pub fn certifies(&self, agree: &BTreeSet<NodeId>) -> bool {
        self.sets.contains(agree)
    }

    /// True when some majority subset is fully contained in `votes`.
    ///
    /// Used to decide whether a candidate has won its election.
    pub fn granted_by(&self, votes: &HashSet<NodeId>) -> bool {
        self.sets
            .iter()
            .any(|set| set.iter().all(|node| votes.contains(node)))
    }

    /// Number of enumerated majority subsets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().map(|&id| NodeId(id)).collect()
    }

    fn set(raw: &[u64]) -> BTreeSet<NodeId> {
        raw.iter().map(|&id| NodeId(id)).collect()
    }

    #[test]
    fn test_three_members_yield_every_majority_subset() {
        let quorum = Quorum::enumerate(&ids(&[1, 2, 3]));

        assert_eq!(quorum.len(), 4);
        assert!(quorum.certifies(&set(&[1, 2])));
        assert!(quorum.certifies(&set(&[1, 3])));
        assert!(quorum.certifies(&set(&[2, 3])));
        assert!(quorum.certifies(&set(&[1, 2, 3])));

        assert!(!quorum.certifies(&set(&[1])));
        assert!(!quorum.certifies(&set(&[])));
    }

    #[test]
    fn test_empty_membership_degenerates_to_the_empty_set() {
        let quorum = Quorum::enumerate(&ids(&[]));
        assert_eq!(quorum.len(), 1);
        assert!(quorum.certifies(&set(&[])));
    }

    #[test]
    fn test_single_member_quorum_is_itself() {
        let quorum = Quorum::enumerate(&ids(&[7]));
        assert_eq!(quorum.len(), 1);
        assert!(quorum.certifies(&set(&[7])));
    }

    #[test]
    fn test_two_members_require_both() {
        let quorum = Quorum::enumerate(&ids(&[1, 2]));
        assert_eq!(quorum.len(), 1);
        assert!(quorum.certifies(&set(&[1, 2])));
        assert!(!quorum.certifies(&set(&[1])));
    }

    #[test]
    fn test_vote_check_is_containment_not_equality() {
        let quorum = Quorum::enumerate(&ids(&[1, 2, 3]));

        let votes: HashSet<NodeId> = [NodeId(1), NodeId(3)].into_iter().collect();
        assert!(quorum.granted_by(&votes));

        let minority: HashSet<NodeId> = [NodeId(2)].into_iter().collect();
        assert!(!quorum.granted_by(&minority));
    }
}
