//! Chooses the next destination for a column after an update (spec §4.5).

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use crate::column::ColumnData;
use crate::permutation::PermutationTable;

/// Routing decision for a column that just finished an update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub next_rank: i32,
    pub perm_index: u32,
}

/// Stateless routing policy plus a dropped-column counter (§7 item 3).
/// One `Router` per worker; it reads the worker's copy of the permutation
/// table but owns no other mutable state.
#[derive(Debug, Default)]
pub struct Router {
    dropped_columns: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped_columns(&self) -> u64 {
        self.dropped_columns.load(Ordering::Relaxed)
    }

    /// Decides the next destination for `column`, which currently sits at
    /// `self_rank`. `world_size` and `local_team_size` determine whether
    /// this is a single-machine cluster (Case A) or a multi-machine one
    /// (Case B); `local_team_contains` and `routing_retry_limit` are only
    /// consulted in Case B's off-machine branch.
    #[allow(clippy::too_many_arguments)]
    pub fn route<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        self_rank: i32,
        world_size: i32,
        local_team_size: i32,
        column: &ColumnData,
        perm: &PermutationTable,
        local_team_contains: impl Fn(i32) -> bool,
        routing_retry_limit: u32,
    ) -> Option<Route> {
        if world_size == local_team_size {
            return Some(self.route_single_machine(rng, self_rank, world_size));
        }

        let pmax = perm.pmax();
        if column.perm_index >= pmax {
            self.route_off_machine(rng, self_rank, world_size, local_team_contains, routing_retry_limit, column.item_index)
        } else {
            Some(self.route_on_machine(self_rank, column.perm_index, perm))
        }
    }

    fn route_single_machine<R: Rng + ?Sized>(&self, rng: &mut R, self_rank: i32, world_size: i32) -> Route {
        let mut next_rank = self_rank;
        while next_rank == self_rank {
            next_rank = rng.gen_range(1..world_size);
        }
        // perm_index is a sentinel here; unused by routing logic (§4.5 Case A).
        Route { next_rank, perm_index: self_rank as u32 }
    }

    fn route_on_machine(&self, self_rank: i32, start: u32, perm: &PermutationTable) -> Route {
        let mut idx = start as usize;
        loop {
            let candidate = perm
                .get(idx)
                .expect("perm_index must stay within the permutation table's bounds");
            if candidate != self_rank {
                return Route { next_rank: candidate, perm_index: idx as u32 + 1 };
            }
            idx += 1;
        }
    }

    fn route_off_machine(
        &self,
        rng: &mut impl Rng,
        self_rank: i32,
        world_size: i32,
        local_team_contains: impl Fn(i32) -> bool,
        retry_limit: u32,
        item_index: u32,
    ) -> Option<Route> {
        for _ in 0..retry_limit {
            let candidate = rng.gen_range(1..world_size);
            if !local_team_contains(candidate) && candidate != self_rank {
                return Some(Route { next_rank: candidate, perm_index: 0 });
            }
        }
        self.dropped_columns.fetch_add(1, Ordering::Relaxed);
        let err = crate::Error::RoutingExhausted { item: item_index, retries: retry_limit };
        error!(%err, "dropping column");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn s4_on_machine_scan_skips_self() {
        // S4: N_local=2, n_retries=3, PERM = [[1,2],[2,1],[1,2]]
        let perm = PermutationTable::from_cells(vec![1, 2, 2, 1, 1, 2], 2);
        let router = Router::new();
        let route = router.route_on_machine(1, 0, &perm);
        assert_eq!(route.next_rank, 2);
        assert_eq!(route.perm_index, 2);
    }

    #[test]
    fn single_machine_never_routes_to_self() {
        let router = Router::new();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let route = router.route_single_machine(&mut rng, 2, 4);
            assert_ne!(route.next_rank, 2);
            assert!((1..4).contains(&route.next_rank));
        }
    }

    #[test]
    fn off_machine_rejects_local_team_and_self() {
        let router = Router::new();
        let mut rng = StdRng::seed_from_u64(4);
        let local = [2, 3];
        for _ in 0..50 {
            let route = router
                .route_off_machine(&mut rng, 2, 6, |r| local.contains(&r), 100, 1)
                .expect("should find an off-machine rank within the retry budget");
            assert!(!local.contains(&route.next_rank));
            assert_eq!(route.perm_index, 0);
        }
        assert_eq!(router.dropped_columns(), 0);
    }

    #[test]
    fn s5_off_machine_resets_perm_index_to_zero() {
        let router = Router::new();
        let mut rng = StdRng::seed_from_u64(5);
        let route = router.route_off_machine(&mut rng, 1, 10, |r| r == 1, 100, 0).unwrap();
        assert_eq!(route.perm_index, 0);
    }

    #[test]
    fn routing_exhaustion_drops_and_counts() {
        let router = Router::new();
        let mut rng = StdRng::seed_from_u64(6);
        // Every candidate rank is "local", so every retry fails.
        let result = router.route_off_machine(&mut rng, 1, 4, |_| true, 5, 42);
        assert!(result.is_none());
        assert_eq!(router.dropped_columns(), 1);
    }
}
