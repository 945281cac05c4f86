//! Drains the local column queue, invokes the kernel, forwards the result
//! (spec §4, component table — "WorkerLoop").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::thread_rng;
use tracing::{debug, info};

use crate::column::ColumnData;
use crate::config::Config;
use crate::kernel::{self, KernelResult};
use crate::loss::LossAggregator;
use crate::permutation::PermutationTable;
use crate::queue::ColumnQueue;
use crate::rating::RatingStore;
use crate::router::Router;
use crate::transport::Transport;

/// Backpressure batching: pending outbound pushes are awaited whenever the
/// highest `t` observed so far is a multiple of this (§5 Backpressure).
const BACKPRESSURE_PERIOD: u32 = 10;

/// A worker rank's main loop state: its slice of the rating store, its W
/// block, its column queue, its loss cell, and the router it consults
/// after every kernel pass.
pub struct WorkerLoop<T: Transport> {
    transport: Arc<T>,
    queue: Arc<ColumnQueue>,
    ratings: RatingStore,
    w_rows: Vec<Vec<f64>>,
    block_size: u32,
    loss: LossAggregator,
    router: Router,
    perm: PermutationTable,
    config: Config,
    stop_requested: AtomicBool,
}

impl<T: Transport> WorkerLoop<T> {
    pub fn new(
        transport: Arc<T>,
        queue: Arc<ColumnQueue>,
        ratings: RatingStore,
        w_rows: Vec<Vec<f64>>,
        block_size: u32,
        loss: LossAggregator,
        perm: PermutationTable,
        config: Config,
    ) -> Self {
        Self {
            transport,
            queue,
            ratings,
            w_rows,
            block_size,
            loss,
            router: Router::new(),
            perm,
            config,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Signals the loop to exit at the next iteration boundary. The core
    /// does not require prompt honoring of this (§5 Cancellation).
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    pub fn dropped_columns(&self) -> u64 {
        self.router.dropped_columns()
    }

    /// Runs until `request_stop` is observed. Each iteration: try to pop a
    /// column, run the kernel, route it, and periodically wait on the
    /// batch of outbound pushes to bound outstanding RPCs (§5).
    pub async fn run(&mut self) {
        let mut max_t_seen: u32 = 0;
        let mut pending_pushes: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut rng = thread_rng();

        info!(rank = self.transport.rank(), "worker loop starting");

        loop {
            if self.stop_requested.load(Ordering::Relaxed) {
                break;
            }

            if let Some(column) = self.queue.try_pop().await {
                let t_before = self
                    .ratings
                    .rows_for_item(column.item_index)
                    .iter()
                    .map(|r| r.count)
                    .max()
                    .unwrap_or(0);
                max_t_seen = max_t_seen.max(t_before);

                let KernelResult { column, sum_squared_loss, count, drop_for_nan } = kernel::update_column(
                    column,
                    &mut self.ratings,
                    &mut self.w_rows,
                    self.block_size,
                    &self.config,
                );

                if count > 0 {
                    self.loss.record(sum_squared_loss, count).await;
                }

                if drop_for_nan {
                    debug!(item = column.item_index, "dropping column after NaN observed");
                } else {
                    self.forward(column, &mut rng, &mut pending_pushes);
                }
            }

            if max_t_seen % BACKPRESSURE_PERIOD == 0 {
                for handle in pending_pushes.drain(..) {
                    let _ = handle.await;
                }
            }
        }

        for handle in pending_pushes.drain(..) {
            let _ = handle.await;
        }
    }

    fn forward(
        &self,
        column: ColumnData,
        rng: &mut impl rand::Rng,
        pending_pushes: &mut Vec<tokio::task::JoinHandle<()>>,
    ) {
        let self_rank = self.transport.rank();
        let world_size = self.transport.world_size();
        let local_team_size = self.perm.n_local_members() as i32
            + if self.transport.local_team_contains(0) { 1 } else { 0 };

        let route = self.router.route(
            rng,
            self_rank,
            world_size,
            local_team_size,
            &column,
            &self.perm,
            |r| self.transport.local_team_contains(r),
            self.config.routing_retry_limit,
        );

        let Some(route) = route else {
            return; // dropped; router already logged and counted it.
        };

        let mut outgoing = column;
        outgoing.perm_index = route.perm_index;

        let transport = self.transport.clone();
        let next_rank = route.next_rank;
        pending_pushes.push(tokio::spawn(async move {
            if let Err(e) = transport.send_column(next_rank, outgoing).await {
                tracing::error!(error = %e, dest = next_rank, "failed to forward column");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalCluster;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.learning_rate = 1e-4;
        cfg
    }

    #[tokio::test]
    async fn worker_processes_one_column_then_forwards_it() {
        let cluster = LocalCluster::single_machine(3);
        let transport = Arc::new(cluster.handle(1));
        let queue = transport.queue();
        let perm = PermutationTable::build(&mut rand::thread_rng(), 40, &[1, 2]);

        let mut ratings = RatingStore::new();
        ratings.insert(0, 0, 0.6);

        queue.push(ColumnData::new(0, vec![0.2, 0.3])).await;

        let mut worker = WorkerLoop::new(
            transport.clone(),
            queue.clone(),
            ratings,
            vec![vec![0.1, 0.4]],
            2,
            LossAggregator::new(),
            perm,
            test_config(),
        );

        let column = worker.queue.try_pop().await.expect("seeded column must be present");
        let KernelResult { column, sum_squared_loss, count, .. } =
            kernel::update_column(column, &mut worker.ratings, &mut worker.w_rows, worker.block_size, &worker.config);
        assert_eq!(count, 1);
        assert!(sum_squared_loss > 0.0);
        worker.loss.record(sum_squared_loss, count).await;

        let mut rng = rand::thread_rng();
        let route = worker
            .router
            .route(&mut rng, 1, 3, 3, &column, &worker.perm, |r| transport.local_team_contains(r), 100)
            .expect("single-machine routing always succeeds");
        transport.send_column(route.next_rank, column).await.unwrap();

        // The forwarded column should have landed in the destination's queue.
        let landed = cluster.queue(route.next_rank).try_pop().await;
        assert!(landed.is_some());
    }
}
