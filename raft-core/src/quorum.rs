//! Quorum size calculations used for vote counting, commit index advancement and read-quorum
//! confirmation.

/// Compute the majority size of a cluster with `len` voting members.
///
/// For a cluster of `n` voters, a majority is `n/2 + 1`.
pub fn majority_of(len: usize) -> usize {
    len / 2 + 1
}

/// Compute the highest index for which a majority of `indexes` agree that they have replicated
/// at least that index, i.e. the committed index implied by a set of per-follower match indexes.
///
/// This is the classic Raft "find the median of the match indexes" rule: sorting the match
/// indexes (including the leader's own) in descending order, the value at the majority-sized
/// offset is the highest index known to be present on a majority of nodes.
pub fn majority_of_match_index(indexes: &[u64]) -> Option<u64> {
    if indexes.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = indexes.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let majority = majority_of(sorted.len());
    sorted.get(majority - 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_sizes() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn match_index_quorum() {
        assert_eq!(majority_of_match_index(&[5, 3, 4]), Some(4));
        assert_eq!(majority_of_match_index(&[5, 5, 1, 1, 1]), Some(1));
        assert_eq!(majority_of_match_index(&[]), None);
    }
}
