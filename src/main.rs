//! NOMAD cluster entrypoint.
//!
//! Rank 0 runs the coordinator: it seeds H-columns onto the worker ranks,
//! waits for every worker to finish ingesting its share of the rating
//! dataset, then polls aggregate loss forever. Every other rank runs a
//! worker: it ingests its local ratings, initializes its W block, builds or
//! receives its local team's permutation table, and enters the column
//! processing loop.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Uniform;
use rand::Rng;
use tracing::info;

use nomad::config::Config;
use nomad::coordinator::Coordinator;
use nomad::ingest;
use nomad::permutation::PermutationTable;
use nomad::rating::RatingStore;
use nomad::transport::mpi_backend::MpiTransport;
use nomad::transport::Transport;
use nomad::worker::WorkerLoop;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    nomad::init_tracing();

    let config = Config::load()?;
    let transport = Arc::new(MpiTransport::init()?);
    let rank = transport.rank();
    let world_size = transport.world_size();
    let n_workers = (world_size - 1) as u32;

    info!(rank, world_size, "NOMAD rank starting");

    if rank == 0 {
        run_coordinator(transport, config).await
    } else {
        run_worker(transport, config, rank, n_workers).await
    }
}

/// Seeds H-columns, waits for ingest to complete cluster-wide, then polls
/// loss until the process is stopped.
async fn run_coordinator(transport: Arc<MpiTransport>, config: Config) -> anyhow::Result<()> {
    let coordinator = Coordinator::new(transport.clone(), config.clone());
    let mut rng = rand::thread_rng();

    coordinator.seed_columns(&mut rng, config.n_items).await?;
    info!(n_items = config.n_items, "H columns seeded across worker ranks");

    coordinator.wait_for_ingest().await?;
    info!("ingest complete cluster-wide, entering loss-poll loop");

    coordinator.poll_loss_forever().await?;
    Ok(())
}

/// Ingests this rank's dataset shard, initializes its W block, resolves its
/// local team's permutation table, and runs the column processing loop
/// until externally stopped.
async fn run_worker(
    transport: Arc<MpiTransport>,
    config: Config,
    rank: i32,
    n_workers: u32,
) -> anyhow::Result<()> {
    let mut rng = rand::thread_rng();
    let block_size = config.block_size(n_workers);
    let w_rows = init_w_block(&mut rng, block_size, config.rank as usize);

    let mut ratings = RatingStore::new();
    let dataset_path = config.dataset_path(rank);
    let report = ingest::load_ratings(
        &dataset_path,
        config.delimiter,
        config.rating_normalizer,
        rank,
        n_workers,
        &mut ratings,
        transport.as_ref(),
    )
    .await?;
    info!(
        rank,
        lines_read = report.lines_read,
        lines_skipped = report.lines_skipped,
        ratings_inserted = report.ratings_inserted,
        "ingest complete"
    );

    let perm = resolve_local_permutation(&transport, &mut rng, rank, config.n_retries).await?;

    transport.barrier().await?;

    let drained = ingest::drain_remote_ratings(transport.as_ref(), &mut ratings).await?;
    info!(rank, drained, "remote rating inserts applied");

    let queue = transport.queue();
    let loss = transport.loss_aggregator().clone();
    let mut worker = WorkerLoop::new(transport.clone(), queue, ratings, w_rows, block_size, loss, perm, config);

    let pump_transport = transport.clone();
    let pump_handle = tokio::spawn(async move {
        loop {
            if let Err(e) = pump_transport.pump_progress() {
                tracing::error!(error = %e, "progress pump failed");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    worker.run().await;

    pump_handle.abort();
    info!(rank, dropped = worker.dropped_columns(), "worker loop exited");
    Ok(())
}

/// Each local team's lowest-numbered worker rank builds the team's
/// permutation table and broadcasts it; every other member of the team
/// receives the same table back (§3).
async fn resolve_local_permutation(
    transport: &Arc<MpiTransport>,
    rng: &mut impl Rng,
    rank: i32,
    n_retries: u32,
) -> anyhow::Result<PermutationTable> {
    let local_workers = transport.local_team_worker_ranks();
    let leader = *local_workers
        .iter()
        .min()
        .expect("a worker rank always belongs to its own local team");

    let table = if rank == leader {
        Some(PermutationTable::build(rng, n_retries, &local_workers))
    } else {
        None
    };

    Ok(transport.broadcast_local(table, leader).await?)
}

/// Initializes a worker's W block with the same `Uniform(0, 1/sqrt(k))`
/// distribution the coordinator uses for H-columns (§4.6).
fn init_w_block(rng: &mut impl Rng, block_size: u32, k: usize) -> Vec<Vec<f64>> {
    let bound = 1.0 / (k as f64).sqrt();
    let dist = Uniform::new(0.0, bound);
    (0..block_size)
        .map(|_| (0..k).map(|_| rng.sample(dist)).collect())
        .collect()
}
