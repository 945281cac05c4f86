//! H-column message (spec §3).

use serde::{Deserialize, Serialize};

/// One item's factor row, travelling nomadically between workers. Exactly
/// one instance per item exists cluster-wide at any moment; ownership
/// transfers atomically on enqueue (§3 invariants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnData {
    pub item_index: u32,
    pub values: Vec<f64>,
    pub perm_index: u32,
}

impl ColumnData {
    pub fn new(item_index: u32, values: Vec<f64>) -> Self {
        Self { item_index, values, perm_index: 0 }
    }

    /// `true` if any component of this column's values is NaN (§4.3
    /// numeric policy, §7 item 4).
    pub fn has_nan(&self) -> bool {
        self.values.iter().any(|v| v.is_nan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_column_starts_at_perm_zero() {
        let col = ColumnData::new(3, vec![0.1, 0.2]);
        assert_eq!(col.perm_index, 0);
        assert_eq!(col.item_index, 3);
    }

    #[test]
    fn detects_nan() {
        let mut col = ColumnData::new(0, vec![1.0, 2.0]);
        assert!(!col.has_nan());
        col.values[0] = f64::NAN;
        assert!(col.has_nan());
    }
}
