//! Seeds H-columns and polls aggregate loss (spec §4.6). Runs on rank 0.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Uniform;
use rand::Rng;
use tracing::info;

use crate::column::ColumnData;
use crate::config::Config;
use crate::loss::poll_loss_forever;
use crate::transport::Transport;

pub struct Coordinator<T: Transport> {
    transport: Arc<T>,
    config: Config,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        Self { transport, config }
    }

    /// Allocates `n_items` H-columns, each initialized to
    /// `Uniform(0, 1/sqrt(k))` per component, and enqueues each one onto a
    /// uniformly random worker rank (§4.6 steps 1-2).
    pub async fn seed_columns<R: Rng>(&self, rng: &mut R, n_items: u32) -> crate::Result<()> {
        let world_size = self.transport.world_size();
        let k = self.config.rank as usize;
        let bound = 1.0 / (k as f64).sqrt();
        let dist = Uniform::new(0.0, bound);

        info!(n_items, world_size, "seeding H columns");
        for item in 0..n_items {
            let values: Vec<f64> = (0..k).map(|_| rng.sample(dist)).collect();
            let column = ColumnData::new(item, values);
            let dest = rng.gen_range(1..world_size);
            self.transport.send_column(dest, column).await?;
        }
        Ok(())
    }

    /// Blocks until ingest has completed on every rank (§4.6 step 3, §5
    /// Ordering).
    pub async fn wait_for_ingest(&self) -> crate::Result<()> {
        self.transport.barrier().await
    }

    /// Enters the loss-polling loop (§4.6 step 4, §4.4). Never returns
    /// under normal operation; shutdown is external (§5 Cancellation).
    pub async fn poll_loss_forever(&self) -> crate::Result<()> {
        let worker_ranks: Vec<i32> = (1..self.transport.world_size()).collect();
        poll_loss_forever(
            self.transport.as_ref(),
            &worker_ranks,
            Duration::from_secs(self.config.loss_poll_interval_secs),
        )
        .await
    }
}
