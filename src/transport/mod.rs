//! RPC substrate contract (spec §4.7, §6).
//!
//! The core consumes exactly five capabilities: in-order point-to-point
//! delivery of a column, a collective barrier, a local-team broadcast, a
//! `local_team_contains` predicate, and a rank-addressed loss fetch. Their
//! reliability is assumed, not reimplemented here (§6: the bootstrap RPC
//! layer is an external collaborator) — a [`Transport`] impl is free to be
//! as thin as [`local::LocalTransport`] or as heavy as [`mpi_backend::MpiTransport`].

pub mod local;
pub mod mpi_backend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::column::ColumnData;
use crate::rating::RatingInbox;

pub use local::LocalTransport;
pub use mpi_backend::MpiTransport;

/// The RPC substrate the core depends on. Implementations must preserve
/// per-(src, dst) FIFO ordering for [`Transport::send_column`] (§4.2) but
/// need not order across different sources.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This rank's identity in the world communicator.
    fn rank(&self) -> i32;

    /// Total number of ranks in the world communicator (including the
    /// coordinator).
    fn world_size(&self) -> i32;

    /// Enqueues `column` onto `dest_rank`'s local [`crate::queue::ColumnQueue`].
    /// Resolves once the remote handler has placed the column in the
    /// queue, not once it has been processed (§4.2).
    async fn send_column(&self, dest_rank: i32, column: ColumnData) -> crate::Result<()>;

    /// Collective barrier across every rank in the world communicator.
    async fn barrier(&self) -> crate::Result<()>;

    /// Broadcasts `data` from `root` to every rank in this rank's local
    /// team. Non-root callers' `data` argument is ignored; all callers
    /// receive the root's value back.
    async fn broadcast_local<T: Serialize + DeserializeOwned + Send + Sync>(
        &self,
        data: Option<T>,
        root: i32,
    ) -> crate::Result<T>;

    /// `true` if `rank` is co-located with this rank (same local team).
    fn local_team_contains(&self, rank: i32) -> bool;

    /// Every rank (excluding the coordinator, rank 0) co-located with this
    /// rank, used to build the [`crate::permutation::PermutationTable`].
    fn local_team_worker_ranks(&self) -> Vec<i32>;

    /// Reads a snapshot of `rank`'s [`crate::loss::LossCell`] as
    /// `(sum_squared_loss, count)`. A torn read is acceptable (§4.4).
    async fn fetch_loss(&self, rank: i32) -> crate::Result<(f64, i64)>;

    /// Forwards one parsed rating to the rank owning `user`, during ingest
    /// (§4.1, §4.8). Kept as its own RPC rather than piggy-backed on
    /// [`Transport::send_column`]: a rating insert is not an H-column, and
    /// the reference implementation (`insert_remote`) never shares a wire
    /// path with column circulation (`push_item`) — see
    /// `examples/original_source/nomad.cpp`.
    async fn send_rating(&self, dest_rank: i32, user: u32, item: u32, rating: f64) -> crate::Result<()>;

    /// This rank's [`RatingInbox`] of rating inserts sent by other ranks
    /// during ingest.
    fn rating_inbox(&self) -> Arc<RatingInbox>;

    /// Cooperative RPC progress pump (§5): drains any inbound messages that
    /// arrived since the last call (columns, rating inserts, loss-fetch
    /// requests). The default no-op is correct for transports, like
    /// [`local::LocalTransport`], that deliver everything synchronously
    /// in-process; [`mpi_backend::MpiTransport`] overrides it.
    fn pump_progress(&self) -> crate::Result<()> {
        Ok(())
    }
}
