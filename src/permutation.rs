//! Per-machine intra-team forwarding schedule (spec §3, §4.5).

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A `[n_retries x n_local_members]` table of rank IDs, built once by the
/// local team leader and broadcast read-only to the team (§3). Cell
/// `[retry][slot]` names a local worker; the router scans it starting at
/// the column's `perm_index` to pick the next intra-machine destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationTable {
    n_local_members: usize,
    cells: Vec<i32>, // row-major: cells[retry * n_local_members + slot]
}

impl PermutationTable {
    /// Builds the table by sampling uniformly from `local_ranks` (the
    /// coordinator's rank, if co-located, must already be excluded by the
    /// caller — see spec §3: "excludes the coordinator").
    pub fn build<R: Rng + ?Sized>(rng: &mut R, n_retries: u32, local_ranks: &[i32]) -> Self {
        assert!(!local_ranks.is_empty(), "local team must have at least one worker");
        let n_local_members = local_ranks.len();
        let mut cells = Vec::with_capacity(n_retries as usize * n_local_members);
        for _ in 0..n_retries {
            for _ in 0..n_local_members {
                let pick = local_ranks[rng.gen_range(0..n_local_members)];
                cells.push(pick);
            }
        }
        Self { n_local_members, cells }
    }

    pub fn n_local_members(&self) -> usize {
        self.n_local_members
    }

    pub fn n_retries(&self) -> usize {
        if self.n_local_members == 0 {
            0
        } else {
            self.cells.len() / self.n_local_members
        }
    }

    pub fn pmax(&self) -> u32 {
        (self.n_retries() * self.n_local_members) as u32
    }

    /// Rank stored at flat index `idx`, or `None` if out of range.
    pub fn get(&self, idx: usize) -> Option<i32> {
        self.cells.get(idx).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Every rank the table can name, for the coverage property test.
    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    /// Builds a table from literal cells, for tests that need a fixed
    /// schedule rather than a randomly sampled one.
    #[cfg(test)]
    pub(crate) fn from_cells(cells: Vec<i32>, n_local_members: usize) -> Self {
        Self { n_local_members, cells }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    proptest! {
        #[test]
        fn permutation_coverage_prop(
            seed in any::<u64>(),
            n_retries in 1u32..50,
            local_ranks in proptest::collection::vec(1i32..32, 1..8),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let table = PermutationTable::build(&mut rng, n_retries, &local_ranks);

            prop_assert_eq!(table.n_retries(), n_retries as usize);
            prop_assert_eq!(table.n_local_members(), local_ranks.len());
            for &rank in table.cells() {
                prop_assert!(local_ranks.contains(&rank));
                prop_assert_ne!(rank, 0, "coordinator rank must never appear in the schedule");
            }
            prop_assert_eq!(table.pmax(), n_retries * local_ranks.len() as u32);
        }
    }

    #[test]
    fn coverage_only_local_ranks_excluding_coordinator() {
        let local_ranks = [1, 2, 4];
        let mut rng = StdRng::seed_from_u64(7);
        let table = PermutationTable::build(&mut rng, 40, &local_ranks);

        assert_eq!(table.n_retries(), 40);
        assert_eq!(table.n_local_members(), 3);
        for &rank in table.cells() {
            assert!(local_ranks.contains(&rank));
            assert_ne!(rank, 0, "coordinator rank must never appear");
        }
    }

    #[test]
    fn pmax_is_n_retries_times_n_local_members() {
        let local_ranks = [1, 2];
        let mut rng = StdRng::seed_from_u64(1);
        let table = PermutationTable::build(&mut rng, 3, &local_ranks);
        assert_eq!(table.pmax(), 6);
    }

    #[test]
    fn s4_permutation_schedule_scan() {
        // S4: N_local=2, n_retries=3, PERM = [[1,2],[2,1],[1,2]]
        let table = PermutationTable { n_local_members: 2, cells: vec![1, 2, 2, 1, 1, 2] };
        assert_eq!(table.get(0), Some(1));
        assert_eq!(table.get(1), Some(2));
        assert_eq!(table.get(2), Some(2));
        assert_eq!(table.get(3), Some(1));
    }
}
