//! Per-rank FIFO of in-flight H-columns (spec §4.2).

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::column::ColumnData;

/// Local half of the column-circulation protocol. Remote pushes arrive
/// through a [`crate::transport::Transport`] impl, which deposits directly
/// into this queue; the owning worker only ever calls [`ColumnQueue::try_pop`].
#[derive(Debug, Default)]
pub struct ColumnQueue {
    items: Mutex<VecDeque<ColumnData>>,
}

impl ColumnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `column` at the back of the queue. Resolves once the column
    /// is in the queue, not once it has been processed (§4.2) — the local
    /// case is always immediate, but the signature stays async so
    /// [`crate::transport::Transport::send_column`] can call straight
    /// through regardless of backend.
    pub async fn push(&self, column: ColumnData) {
        self.items.lock().await.push_back(column);
    }

    /// Non-blocking local dequeue.
    pub async fn try_pop(&self) -> Option<ColumnData> {
        self.items.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
