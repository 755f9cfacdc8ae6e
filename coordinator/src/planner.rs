use std::collections::BTreeMap;

use network::NodeId;

/// Splits `total_qty` across `branches` in proportion to each branch's free
/// space.
///
/// Negative space counts as zero. When no branch has any space every branch
/// gets an equal share. Flooring leaves a shortfall that goes entirely to the
/// branch with the most space; among equals, the one listed first. With no
/// branches at all, `requester` receives everything.
///
/// The allocations always sum to exactly `total_qty`.
pub fn plan(total_qty: u64, branches: &[(NodeId, i64)], requester: NodeId) -> BTreeMap<NodeId, u64> {
    let mut allocations = BTreeMap::new();

    if branches.is_empty() {
        allocations.insert(requester, total_qty);
        return allocations;
    }

    let spaces: Vec<(NodeId, u64)> = branches
        .iter()
        .map(|(branch, space)| (*branch, (*space).max(0) as u64))
        .collect();
    let total_space: u128 = spaces.iter().map(|(_, space)| *space as u128).sum();
    let equal_share = total_qty / spaces.len() as u64;

    for (branch, space) in &spaces {
        let share = if total_space == 0 {
            equal_share
        } else {
            (total_qty as u128 * *space as u128 / total_space) as u64
        };
        *allocations.entry(*branch).or_insert(0) += share;
    }

    let assigned: u64 = allocations.values().sum();
    let shortfall = total_qty - assigned;
    if shortfall > 0 {
        let (largest, _) = spaces
            .iter()
            .skip(1)
            .fold(spaces[0], |best, candidate| if candidate.1 > best.1 { *candidate } else { best });
        *allocations.entry(largest).or_insert(0) += shortfall;
    }

    allocations
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);
    const C: NodeId = NodeId(3);

    fn alloc(pairs: &[(NodeId, u64)]) -> BTreeMap<NodeId, u64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn proportional_split() {
        assert_eq!(plan(100, &[(A, 30), (B, 10)], A), alloc(&[(A, 75), (B, 25)]));
    }

    #[test]
    fn zero_space_splits_evenly() {
        assert_eq!(plan(10, &[(A, 0), (B, 0)], A), alloc(&[(A, 5), (B, 5)]));
    }

    #[test]
    fn remainder_goes_to_largest_space() {
        // 10 * 1/3 floors to 3 each; the spare unit goes to the first of the
        // tied branches.
        assert_eq!(plan(10, &[(A, 5), (B, 5), (C, 5)], C), alloc(&[(A, 4), (B, 3), (C, 3)]));
        assert_eq!(plan(10, &[(A, 1), (B, 2)], A), alloc(&[(A, 3), (B, 7)]));
    }

    #[test]
    fn zero_space_remainder_goes_to_first_branch() {
        assert_eq!(plan(7, &[(B, 0), (A, 0)], C), alloc(&[(A, 3), (B, 4)]));
    }

    #[test]
    fn negative_space_gets_nothing() {
        assert_eq!(plan(9, &[(A, -20), (B, 3)], A), alloc(&[(A, 0), (B, 9)]));
    }

    #[test]
    fn no_branches_falls_back_to_requester() {
        assert_eq!(plan(42, &[], C), alloc(&[(C, 42)]));
    }

    #[test]
    fn zero_quantity_allocates_zero_everywhere() {
        assert_eq!(plan(0, &[(A, 3), (B, 1)], A), alloc(&[(A, 0), (B, 0)]));
    }

    fn branches() -> impl Strategy<Value = Vec<(NodeId, i64)>> {
        prop::collection::btree_map(1u32..64, -50i64..500, 1..12)
            .prop_map(|m| m.into_iter().map(|(id, space)| (NodeId(id), space)).collect())
    }

    proptest! {
        #[test]
        fn allocations_sum_to_total(total in 0u64..1_000_000, branches in branches()) {
            let result = plan(total, &branches, A);
            prop_assert_eq!(result.values().sum::<u64>(), total);
            prop_assert_eq!(result.len(), branches.len());
        }

        #[test]
        fn shortfall_lands_on_largest_space(total in 0u64..100_000, branches in branches()) {
            let result = plan(total, &branches, A);
            let largest = branches.iter().map(|(_, s)| (*s).max(0)).max().unwrap_or(0);
            let (winner, _) = *branches.iter().find(|(_, s)| (*s).max(0) == largest).unwrap();
            let total_space: i64 = branches.iter().map(|(_, s)| (*s).max(0)).sum();

            for (branch, space) in &branches {
                let space = (*space).max(0);
                let floor = if total_space == 0 {
                    total / branches.len() as u64
                } else {
                    (total as u128 * space as u128 / total_space as u128) as u64
                };
                if *branch == winner {
                    prop_assert!(result[branch] >= floor);
                } else {
                    prop_assert_eq!(result[branch], floor);
                }
            }
        }
    }
}
