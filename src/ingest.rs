//! CSV/TSV rating-file adapter (spec §6, §4.8).
//!
//! Deliberately thin and isolated from the core protocol: it exists so the
//! crate is runnable end-to-end, but any file format can be substituted as
//! long as the resulting calls preserve the routing invariant in §3 (spec
//! §9 "Dataset ingest as external collaborator").

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tracing::warn;

use crate::rating::RatingStore;
use crate::transport::Transport;

/// How many times ingest pumps the transport's progress loop, waiting a
/// short grace period between each, before draining whatever has arrived in
/// this rank's rating inbox. Needed only by transports (the MPI backend)
/// whose `send_rating` resolves once a message is handed to the substrate,
/// not once the destination has applied it — [`crate::transport::local::LocalTransport`]
/// delivers synchronously and drains everything on the first pass.
const INGEST_DRAIN_PASSES: u32 = 20;
const INGEST_DRAIN_INTERVAL: Duration = Duration::from_millis(5);

/// Outcome of one ingest pass, surfaced for logging (§7 item 1:
/// ingest-parse errors are non-fatal and counted, not propagated).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub lines_read: u64,
    pub lines_skipped: u64,
    pub ratings_inserted: u64,
}

/// Parses one line of the dataset per §6's field rules: at least four
/// delimited fields; fields 1-3 are 1-based `user_id`, `item_id`, `rating`;
/// field 4 must be present (its content is ignored). The reference
/// requires exactly four tokens (`e_idx == 4`) — preserved per SPEC_FULL.md
/// §9 open question 3 — so a line with more than four fields is also
/// skipped, not just fewer.
pub fn parse_line(line: &str, delimiter: char, rating_normalizer: f64) -> Option<(u32, u32, f64)> {
    let fields: Vec<&str> = line.split(delimiter).collect();
    if fields.len() != 4 {
        return None;
    }

    let user_id: i64 = fields[0].trim().parse().ok()?;
    let item_id: i64 = fields[1].trim().parse().ok()?;
    let raw_rating: f64 = fields[2].trim().parse().ok()?;

    if user_id < 1 || item_id < 1 {
        return None;
    }

    let user = (user_id - 1) as u32;
    let item = (item_id - 1) as u32;
    let rating = raw_rating / rating_normalizer;
    Some((user, item, rating))
}

/// Reads `path` and inserts every well-formed rating into `local_store` if
/// this rank owns the user, or forwards it over `transport` to the rank
/// that does (§4.1 routing function). `n_workers` is `world_size - 1`.
pub async fn load_ratings<T: Transport>(
    path: impl AsRef<Path>,
    delimiter: char,
    rating_normalizer: f64,
    this_rank: i32,
    n_workers: u32,
    local_store: &mut RatingStore,
    transport: &T,
) -> crate::Result<IngestReport> {
    let contents = fs::read_to_string(path).await?;
    let mut report = IngestReport::default();

    for line in contents.lines() {
        report.lines_read += 1;
        match parse_line(line, delimiter, rating_normalizer) {
            None => report.lines_skipped += 1,
            Some((user, item, rating)) => {
                let owner = RatingStore::owning_rank(user, n_workers);
                if owner == this_rank {
                    local_store.insert(user, item, rating);
                } else if let Err(e) = transport.send_rating(owner, user, item, rating).await {
                    warn!(error = %e, owner, "failed to forward ingested rating");
                }
                report.ratings_inserted += 1;
            }
        }
    }

    Ok(report)
}

/// Drains this rank's [`crate::rating::RatingInbox`] into `local_store`.
/// Call once the cluster-wide ingest barrier (§4.6 step 3, §5 Ordering)
/// confirms every rank has finished sending — pumping the transport first
/// for backends that need an explicit progress pump to deliver inbound
/// messages (§5 suspension points).
pub async fn drain_remote_ratings<T: Transport>(
    transport: &T,
    local_store: &mut RatingStore,
) -> crate::Result<u64> {
    for _ in 0..INGEST_DRAIN_PASSES {
        transport.pump_progress()?;
        tokio::time::sleep(INGEST_DRAIN_INTERVAL).await;
    }
    Ok(transport.rating_inbox().drain_into(local_store).await as u64)
}
