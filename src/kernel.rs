//! One SGD step over all local rows touching a popped column (spec §4.3).

use tracing::warn;

use crate::column::ColumnData;
use crate::config::Config;
use crate::rating::RatingStore;

/// Outcome of running the kernel over one column: the (possibly NaN-tainted)
/// updated column, and the squared-loss sum accumulated this pass.
pub struct KernelResult {
    pub column: ColumnData,
    pub sum_squared_loss: f64,
    pub count: i64,
    /// `true` if the caller should drop the column instead of forwarding it
    /// (§4.3 numeric policy, §7 item 4; only set when `config.drop_on_nan`).
    pub drop_for_nan: bool,
}

/// Runs one SGD pass of `column` against every local rating that touches
/// `column.item_index`, mutating `w_rows` (this worker's W block) and
/// `ratings`'s per-edge update counters in place, and returning the updated
/// column plus the loss contribution of this pass.
///
/// `w_rows` is indexed by local user index (`global_user % block_size`), as
/// in §3's definition of W.
pub fn update_column(
    mut column: ColumnData,
    ratings: &mut RatingStore,
    w_rows: &mut [Vec<f64>],
    block_size: u32,
    config: &Config,
) -> KernelResult {
    let item = column.item_index;
    let rows = ratings.rows_for_item(item);

    let mut sum_squared_loss = 0.0;
    let mut count: i64 = 0;
    let mut drop_for_nan = false;

    for row in rows {
        let local_idx = (row.user % block_size) as usize;
        let w = w_rows[local_idx].clone();

        ratings.bump_count(row.user, item);
        let t = row.count; // pre-increment count, per §4.3 step 3/4.

        let eta = config.learning_rate * 1.5 / (1.0 + config.decay_rate * (t as f64 + 1.0).powf(1.5));

        let dot: f64 = w.iter().zip(column.values.iter()).map(|(a, b)| a * b).sum();
        let e = row.value - dot;

        // Sign convention preserved bit-faithfully from the reference
        // (see SPEC_FULL.md §9 open question 1): this minimizes
        // (r + <w,h>)^2 + lambda*||w||^2, not (r - <w,h>)^2 + lambda*||w||^2.
        for idx in 0..w.len() {
            w_rows[local_idx][idx] = w[idx] - eta * (e * column.values[idx] + config.lambda * w[idx]);
            column.values[idx] = column.values[idx] - eta * (e * w[idx] + config.lambda * column.values[idx]);
        }

        sum_squared_loss += e * e;
        count += 1;

        if column.has_nan() || w_rows[local_idx].iter().any(|v| v.is_nan()) {
            warn!(item, user = row.user, "NaN observed in factor row during update");
            if config.drop_on_nan {
                drop_for_nan = true;
            }
        }
    }

    KernelResult { column, sum_squared_loss, count, drop_for_nan }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn kernel_idempotent_at_zero_learning_rate_prop(
            w0 in -1.0..1.0f64, w1 in -1.0..1.0f64,
            h0 in -1.0..1.0f64, h1 in -1.0..1.0f64,
            rating in 0.0..1.0f64,
            t in 0u32..1000,
        ) {
            let mut ratings = RatingStore::new();
            ratings.insert(0, 0, rating);
            for _ in 0..t {
                ratings.bump_count(0, 0);
            }
            let mut w_rows = vec![vec![w0, w1]];
            let column = ColumnData::new(0, vec![h0, h1]);
            let mut cfg = Config::default();
            cfg.learning_rate = 0.0;

            let w_before = w_rows.clone();
            let h_before = column.values.clone();
            let dot = w0 * h0 + w1 * h1;
            let expected_e = rating - dot;

            let result = update_column(column, &mut ratings, &mut w_rows, 2, &cfg);

            prop_assert_eq!(w_rows, w_before);
            prop_assert_eq!(result.column.values, h_before);
            prop_assert!((result.sum_squared_loss - expected_e * expected_e).abs() < 1e-9);
        }
    }

    fn s1_config() -> Config {
        let mut cfg = Config::default();
        cfg.learning_rate = 1e-4;
        cfg.lambda = 0.05;
        cfg.decay_rate = 0.012;
        cfg
    }

    #[test]
    fn s1_single_rating_two_workers() {
        // S1: m=2, n=1, k=2, rating (u=1,i=1,r=5.0) normalized to 1.0.
        // Seed h_1 = [0.1, 0.2]; W[0] = [0.3, 0.4]; worker owns user 0.
        let mut ratings = RatingStore::new();
        ratings.insert(0, 0, 1.0); // zero-based user 0, item 0, normalized rating
        let mut w_rows = vec![vec![0.3, 0.4]];
        let column = ColumnData::new(0, vec![0.1, 0.2]);
        let cfg = s1_config();

        let result = update_column(column, &mut ratings, &mut w_rows, 2, &cfg);

        let expected_e = 0.89_f64;
        let expected_eta = 1e-4 * 1.5 / (1.0 + 0.012 * 1f64.powf(1.5)); // t=0 -> (t+1)=1
        assert!((expected_eta - 1.4822e-4).abs() < 1e-7);

        assert!((result.sum_squared_loss - expected_e * expected_e).abs() < 1e-9);
        assert_eq!(result.count, 1);

        let expected_w0 = 0.3 - expected_eta * (expected_e * 0.1 + 0.05 * 0.3);
        let expected_w1 = 0.4 - expected_eta * (expected_e * 0.2 + 0.05 * 0.4);
        assert!((w_rows[0][0] - expected_w0).abs() < 1e-9);
        assert!((w_rows[0][1] - expected_w1).abs() < 1e-9);

        let expected_h0 = 0.1 - expected_eta * (expected_e * 0.3 + 0.05 * 0.1);
        let expected_h1 = 0.2 - expected_eta * (expected_e * 0.4 + 0.05 * 0.2);
        assert!((result.column.values[0] - expected_h0).abs() < 1e-9);
        assert!((result.column.values[1] - expected_h1).abs() < 1e-9);

        // count was bumped from 0 to 1 as a side effect.
        assert_eq!(ratings.rows_for_item(0)[0].count, 1);
    }

    #[test]
    fn s3_empty_local_ratings_is_a_no_op() {
        let mut ratings = RatingStore::new();
        let mut w_rows: Vec<Vec<f64>> = vec![vec![0.1, 0.2]];
        let column = ColumnData::new(5, vec![0.3, 0.4]);
        let cfg = s1_config();

        let result = update_column(column.clone(), &mut ratings, &mut w_rows, 2, &cfg);

        assert_eq!(result.count, 0);
        assert_eq!(result.sum_squared_loss, 0.0);
        assert_eq!(result.column, column);
        assert_eq!(w_rows[0], vec![0.1, 0.2]);
    }

    #[test]
    fn kernel_idempotent_at_zero_learning_rate() {
        let mut ratings = RatingStore::new();
        ratings.insert(0, 0, 0.6);
        let mut w_rows = vec![vec![0.2, 0.5]];
        let column = ColumnData::new(0, vec![0.4, 0.1]);
        let mut cfg = s1_config();
        cfg.learning_rate = 0.0;

        let w_before = w_rows.clone();
        let h_before = column.values.clone();

        let expected_dot: f64 = w_before[0].iter().zip(h_before.iter()).map(|(a, b)| a * b).sum();
        let expected_e = 0.6 - expected_dot;

        let result = update_column(column, &mut ratings, &mut w_rows, 2, &cfg);

        assert_eq!(w_rows, w_before);
        assert_eq!(result.column.values, h_before);
        assert!((result.sum_squared_loss - expected_e * expected_e).abs() < 1e-12);
    }

    #[test]
    fn multiple_ratings_on_same_column_all_update() {
        let mut ratings = RatingStore::new();
        ratings.insert(0, 0, 0.5);
        ratings.insert(1, 0, 0.7);
        let mut w_rows = vec![vec![0.1, 0.1], vec![0.2, 0.2]];
        let column = ColumnData::new(0, vec![0.3, 0.3]);
        let cfg = s1_config();

        let result = update_column(column, &mut ratings, &mut w_rows, 2, &cfg);
        assert_eq!(result.count, 2);
    }
}
