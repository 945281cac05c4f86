//! In-process [`Transport`] backed by `tokio::sync::mpsc`, used by tests and
//! single-machine runs where a real MPI universe would be overkill.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::column::ColumnData;
use crate::loss::LossAggregator;
use crate::queue::ColumnQueue;
use crate::rating::RatingInbox;

use super::Transport;

/// Shared state for a cluster of [`LocalTransport`] handles living in one
/// process. Ranks are grouped into local teams by index into `teams`;
/// `team_of[rank]` gives the owning team.
pub struct LocalCluster {
    queues: Vec<Arc<ColumnQueue>>,
    losses: Vec<LossAggregator>,
    rating_inboxes: Vec<Arc<RatingInbox>>,
    teams: Vec<Vec<i32>>,
    team_of: Vec<usize>,
    // Serializes broadcast_local so concurrent callers observe one winner,
    // mirroring a real collective's single outcome.
    broadcast_lock: Arc<Mutex<()>>,
}

impl LocalCluster {
    /// Builds a cluster of `world_size` ranks with a single local team
    /// containing every rank (the common case for unit tests).
    pub fn single_machine(world_size: usize) -> Arc<Self> {
        let team: Vec<i32> = (0..world_size as i32).collect();
        Self::with_teams(world_size, vec![team])
    }

    /// Builds a cluster with an explicit team layout. `teams[i]` lists the
    /// ranks co-located on machine `i`; every rank must appear in exactly
    /// one team.
    pub fn with_teams(world_size: usize, teams: Vec<Vec<i32>>) -> Arc<Self> {
        let mut team_of = vec![usize::MAX; world_size];
        for (team_id, members) in teams.iter().enumerate() {
            for &rank in members {
                team_of[rank as usize] = team_id;
            }
        }
        assert!(team_of.iter().all(|&t| t != usize::MAX), "every rank must be assigned a team");

        Arc::new(Self {
            queues: (0..world_size).map(|_| Arc::new(ColumnQueue::new())).collect(),
            losses: (0..world_size).map(|_| LossAggregator::new()).collect(),
            rating_inboxes: (0..world_size).map(|_| Arc::new(RatingInbox::new())).collect(),
            teams,
            team_of,
            broadcast_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn world_size(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, rank: i32) -> Arc<ColumnQueue> {
        self.queues[rank as usize].clone()
    }

    pub fn loss(&self, rank: i32) -> &LossAggregator {
        &self.losses[rank as usize]
    }

    pub fn rating_inbox(&self, rank: i32) -> Arc<RatingInbox> {
        self.rating_inboxes[rank as usize].clone()
    }

    pub fn handle(self: &Arc<Self>, rank: i32) -> LocalTransport {
        LocalTransport { rank, cluster: self.clone() }
    }
}

/// A [`Transport`] handle for one rank of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalTransport {
    rank: i32,
    cluster: Arc<LocalCluster>,
}

impl LocalTransport {
    pub fn loss_aggregator(&self) -> &LossAggregator {
        self.cluster.loss(self.rank)
    }

    pub fn queue(&self) -> Arc<ColumnQueue> {
        self.cluster.queue(self.rank)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn world_size(&self) -> i32 {
        self.cluster.world_size() as i32
    }

    async fn send_column(&self, dest_rank: i32, column: ColumnData) -> crate::Result<()> {
        self.cluster.queue(dest_rank).push(column).await;
        Ok(())
    }

    async fn barrier(&self) -> crate::Result<()> {
        // All ranks live in the same process; there is nothing to wait on.
        Ok(())
    }

    async fn broadcast_local<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        data: Option<T>,
        root: i32,
    ) -> crate::Result<T> {
        let _guard = self.cluster.broadcast_lock.lock().await;
        if self.rank == root {
            data.ok_or_else(|| {
                crate::Error::Transport("broadcast root called without data".to_string())
            })
        } else {
            // A real broadcast delivers the root's value to every other
            // rank; in-process, the caller is expected to already share
            // that value (e.g. via the permutation table built by the
            // team leader before any non-root asks). This stub exists so
            // call sites are transport-agnostic; tests that exercise
            // cross-rank broadcast should pass the value through directly.
            Err(crate::Error::Transport(
                "LocalTransport cannot synthesize a non-root broadcast value".to_string(),
            ))
        }
    }

    fn local_team_contains(&self, rank: i32) -> bool {
        let my_team = self.cluster.team_of[self.rank as usize];
        self.cluster.teams[my_team].contains(&rank)
    }

    fn local_team_worker_ranks(&self) -> Vec<i32> {
        let my_team = self.cluster.team_of[self.rank as usize];
        self.cluster.teams[my_team]
            .iter()
            .copied()
            .filter(|&r| r != 0)
            .collect()
    }

    async fn fetch_loss(&self, rank: i32) -> crate::Result<(f64, i64)> {
        let snap = self.cluster.loss(rank).snapshot().await;
        Ok((snap.sum_squared_loss, snap.count))
    }

    async fn send_rating(&self, dest_rank: i32, user: u32, item: u32, rating: f64) -> crate::Result<()> {
        self.cluster.rating_inbox(dest_rank).push(user, item, rating).await;
        Ok(())
    }

    fn rating_inbox(&self) -> Arc<RatingInbox> {
        self.cluster.rating_inbox(self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_column_lands_in_destination_queue() {
        let cluster = LocalCluster::single_machine(3);
        let from = cluster.handle(1);
        from.send_column(2, ColumnData::new(5, vec![0.1, 0.2])).await.unwrap();

        let popped = cluster.queue(2).try_pop().await;
        assert_eq!(popped.unwrap().item_index, 5);
    }

    #[tokio::test]
    async fn fifo_per_edge() {
        let cluster = LocalCluster::single_machine(2);
        let from = cluster.handle(0);
        from.send_column(1, ColumnData::new(1, vec![])).await.unwrap();
        from.send_column(1, ColumnData::new(2, vec![])).await.unwrap();

        let first = cluster.queue(1).try_pop().await.unwrap();
        let second = cluster.queue(1).try_pop().await.unwrap();
        assert_eq!(first.item_index, 1);
        assert_eq!(second.item_index, 2);
    }

    #[tokio::test]
    async fn send_rating_lands_in_destination_inbox_not_the_column_queue() {
        let cluster = LocalCluster::single_machine(3);
        let from = cluster.handle(1);
        from.send_rating(2, 9, 5, 0.6).await.unwrap();

        assert!(cluster.queue(2).try_pop().await.is_none());

        let mut store = crate::rating::RatingStore::new();
        let n = cluster.rating_inbox(2).drain_into(&mut store).await;
        assert_eq!(n, 1);
        assert_eq!(store.rows_for_item(5)[0].user, 9);
    }

    #[test]
    fn local_team_contains_excludes_other_teams() {
        let cluster = LocalCluster::with_teams(4, vec![vec![0, 1, 2], vec![3]]);
        let h1 = cluster.handle(1);
        assert!(h1.local_team_contains(2));
        assert!(!h1.local_team_contains(3));
        assert_eq!(h1.local_team_worker_ranks(), vec![1, 2]);
    }
}
