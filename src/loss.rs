//! Per-worker loss accumulation and coordinator-side aggregation (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::info;

use crate::transport::Transport;

/// Mutable `(sum_squared_loss, count)` pair. Single writer (the owning
/// worker), multiple readers (the coordinator); a torn read across the two
/// fields is acceptable because reporting is advisory (§3, §9 open
/// question 4) — it must never gate an algorithmic decision.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LossCell {
    pub sum_squared_loss: f64,
    pub count: i64,
}

impl LossCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the squared residuals accumulated while processing one column.
    pub fn add(&mut self, sum_squared_loss: f64, count: i64) {
        self.sum_squared_loss += sum_squared_loss;
        self.count += count;
    }

    /// Resets both fields to zero. Not required by the core; offered for
    /// implementations that want periodic reporting windows.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn rmse(&self) -> f64 {
        if self.count > 0 {
            (self.sum_squared_loss / self.count as f64).sqrt()
        } else {
            0.0
        }
    }
}

/// Worker-side owner of a [`LossCell`], readable (snapshot) from any rank
/// via the transport's `fetch_loss`.
#[derive(Debug, Clone)]
pub struct LossAggregator {
    cell: Arc<RwLock<LossCell>>,
}

impl LossAggregator {
    pub fn new() -> Self {
        Self { cell: Arc::new(RwLock::new(LossCell::new())) }
    }

    pub async fn record(&self, sum_squared_loss: f64, count: i64) {
        self.cell.write().await.add(sum_squared_loss, count);
    }

    pub async fn snapshot(&self) -> LossCell {
        *self.cell.read().await
    }

    pub async fn reset(&self) {
        self.cell.write().await.reset();
    }
}

impl Default for LossAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator-side loss poll loop (§4.6 step 4). Fetches every worker's
/// `LossCell` on a coarse period and logs the cumulative RMSE. Runs until
/// the process is stopped externally (§5 Cancellation: none in the core).
pub async fn poll_loss_forever<T: Transport>(
    transport: &T,
    worker_ranks: &[i32],
    poll_interval: Duration,
) -> crate::Result<()> {
    loop {
        sleep(poll_interval).await;

        let mut total_sum_sq = 0.0;
        let mut total_count: i64 = 0;
        for &rank in worker_ranks {
            let (sum_sq, count) = transport.fetch_loss(rank).await?;
            total_sum_sq += sum_sq;
            total_count += count;
        }

        let rmse = aggregate_rmse(total_sum_sq, total_count);
        info!(rmse, total_count, "training loss");
    }
}

/// Combines cumulative sums across workers into a single RMSE (S6).
pub fn aggregate_rmse(total_sum_sq: f64, total_count: i64) -> f64 {
    if total_count > 0 {
        (total_sum_sq / total_count as f64).sqrt()
    } else {
        0.0
    }
}
