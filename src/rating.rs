//! Sharded user→item rating store (spec §3, §4.1).

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::warn;

/// One (user, item) edge. Immutable except for `count`, which increments
/// each time the edge participates in an SGD step (§4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rating {
    pub user: u32,
    pub item: u32,
    pub value: f64,
    pub count: u32,
}

/// Process-local mapping item → user → (rating, count). Owned exclusively
/// by its host rank; inserted during ingest, and after ingest only `count`
/// is mutated, by the local worker loop (§3).
#[derive(Debug, Default)]
pub struct RatingStore {
    by_item: HashMap<u32, HashMap<u32, (f64, u32)>>,
}

impl RatingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rank that owns ratings for `user`, given `n_workers` workers
    /// (ranks 1..=n_workers, rank 0 is the coordinator). This is the only
    /// hash in the system — the coordinator holds no ratings.
    pub fn owning_rank(user: u32, n_workers: u32) -> i32 {
        1 + (user % n_workers) as i32
    }

    /// Inserts `(user, item) -> (rating, count = 0)`. Idempotent on
    /// duplicate (user, item): last write wins, count resets to 0, matching
    /// the reference's unconditional overwrite.
    pub fn insert(&mut self, user: u32, item: u32, rating: f64) {
        self.by_item.entry(item).or_default().insert(user, (rating, 0));
    }

    /// Snapshot of all local users who rated `item`. Empty if none.
    pub fn rows_for_item(&self, item: u32) -> Vec<Rating> {
        match self.by_item.get(&item) {
            None => Vec::new(),
            Some(users) => users
                .iter()
                .map(|(&user, &(value, count))| Rating { user, item, value, count })
                .collect(),
        }
    }

    /// Increments `count` for edge `(user, item)`. A miss indicates a
    /// routing bug (§7 item 2): logged once per call site, not fatal.
    pub fn bump_count(&mut self, user: u32, item: u32) {
        match self.by_item.get_mut(&item).and_then(|users| users.get_mut(&user)) {
            Some(entry) => entry.1 += 1,
            None => warn!(user, item, "bump_count on missing edge — routing bug"),
        }
    }

    /// Total number of edges stored locally, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.by_item.values().map(|users| users.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound remote rating inserts delivered by a
/// [`crate::transport::Transport`] during ingest, kept separate from the
/// [`crate::queue::ColumnQueue`]: a rating insert is not an H-column, and
/// the reference implementation routes it over its own RPC
/// (`insert_remote`) rather than the column-circulation channel
/// (`push_item`) — see `examples/original_source/nomad.cpp`. Drained into a
/// `RatingStore` once the ingest barrier confirms every rank has issued its
/// sends (§4.8, §5 Ordering).
#[derive(Debug, Default)]
pub struct RatingInbox {
    items: Mutex<VecDeque<(u32, u32, f64)>>,
}

impl RatingInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, user: u32, item: u32, rating: f64) {
        self.items.lock().await.push_back((user, item, rating));
    }

    /// Moves every currently-queued insert into `store`, returning how many
    /// were applied.
    pub async fn drain_into(&self, store: &mut RatingStore) -> usize {
        let mut items = self.items.lock().await;
        let n = items.len();
        for (user, item, rating) in items.drain(..) {
            store.insert(user, item, rating);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn routing_determinism_prop(user in 0u32..1_000_000, n_workers in 1u32..64) {
            let rank = RatingStore::owning_rank(user, n_workers);
            prop_assert_eq!(rank, 1 + (user % n_workers) as i32);
            prop_assert!((1..=n_workers as i32).contains(&rank));
        }

        #[test]
        fn insert_then_bump_is_idempotent_on_duplicate_insert(
            user in 0u32..1000, item in 0u32..1000, r1 in 0.0..1.0, r2 in 0.0..1.0,
        ) {
            let mut store = RatingStore::new();
            store.insert(user, item, r1);
            store.bump_count(user, item);
            store.insert(user, item, r2); // re-insert resets count (§4.1)

            let rows = store.rows_for_item(item);
            prop_assert_eq!(rows.len(), 1);
            prop_assert_eq!(rows[0].value, r2);
            prop_assert_eq!(rows[0].count, 0);
        }
    }

    #[test]
    fn routing_determinism() {
        // rank(i) = 1 + (i mod (P-1)), with P-1 workers.
        let n_workers = 4;
        for user in 0..100u32 {
            let expected = 1 + (user % n_workers) as i32;
            assert_eq!(RatingStore::owning_rank(user, n_workers), expected);
        }
    }

    #[test]
    fn insert_then_rows_for_item() {
        let mut store = RatingStore::new();
        store.insert(1, 7, 0.8);
        store.insert(2, 7, 0.4);

        let mut rows = store.rows_for_item(7);
        rows.sort_by_key(|r| r.user);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Rating { user: 1, item: 7, value: 0.8, count: 0 });
        assert_eq!(rows[1], Rating { user: 2, item: 7, value: 0.4, count: 0 });
    }

    #[test]
    fn rows_for_missing_item_is_empty() {
        let store = RatingStore::new();
        assert!(store.rows_for_item(42).is_empty());
    }

    #[test]
    fn duplicate_insert_resets_count() {
        let mut store = RatingStore::new();
        store.insert(1, 7, 0.8);
        store.bump_count(1, 7);
        store.bump_count(1, 7);
        store.insert(1, 7, 0.5); // last write wins, count resets

        let rows = store.rows_for_item(7);
        assert_eq!(rows[0].value, 0.5);
        assert_eq!(rows[0].count, 0);
    }

    #[test]
    fn bump_count_on_missing_edge_is_noop() {
        let mut store = RatingStore::new();
        store.insert(1, 7, 0.8);
        store.bump_count(2, 7); // different user, same item: absent edge
        let rows = store.rows_for_item(7);
        assert_eq!(rows[0].count, 0);
    }

    #[tokio::test]
    async fn rating_inbox_drains_into_store() {
        let inbox = RatingInbox::new();
        inbox.push(1, 2, 0.4).await;
        inbox.push(3, 2, 0.6).await;

        let mut store = RatingStore::new();
        let n = inbox.drain_into(&mut store).await;

        assert_eq!(n, 2);
        let mut rows = store.rows_for_item(2);
        rows.sort_by_key(|r| r.user);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user, 1);
        assert_eq!(rows[1].user, 3);
    }
}
