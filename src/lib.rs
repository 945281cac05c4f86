//! # NOMAD
//!
//! A distributed asynchronous SGD engine for low-rank matrix factorization of
//! large sparse rating matrices. Workers each own a horizontal band of the
//! user-factor matrix W and circulate item-factor columns (H) between them,
//! updating each column against the local ratings that touch it before
//! forwarding it on — a "nomadic" column model that avoids global
//! synchronization barriers.

pub mod column;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod kernel;
pub mod loss;
pub mod permutation;
pub mod queue;
pub mod rating;
pub mod router;
pub mod transport;
pub mod worker;

pub use column::ColumnData;
pub use config::Config;
pub use coordinator::Coordinator;
pub use loss::{LossAggregator, LossCell};
pub use permutation::PermutationTable;
pub use queue::ColumnQueue;
pub use rating::{Rating, RatingInbox, RatingStore};
pub use router::Router;
pub use transport::Transport;
pub use worker::WorkerLoop;

/// Initializes process-wide logging. Call once, before any other NOMAD API.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            "nomad=info".parse().expect("static directive parses"),
        ))
        .init();
}

/// Errors that can surface from the NOMAD core. Per the error taxonomy,
/// only [`Error::Transport`] is treated as fatal to a rank; everything else
/// is recovered locally and logged (see `kernel`, `router`, `rating`).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("routing exhaustion on item {item}: {retries} retries")]
    RoutingExhausted { item: u32, retries: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
