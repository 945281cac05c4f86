//! Static run configuration.
//!
//! Layered: compiled-in defaults, optionally overridden by a `Nomad.toml`
//! file, then by `NOMAD_*` environment variables. Resolved once at startup;
//! NOMAD has no dynamic reconfiguration (see §6).

use serde::{Deserialize, Serialize};

/// Run parameters for a NOMAD cluster. Every field must agree across ranks;
/// a mismatch (e.g. different `n_workers`) breaks the routing invariant in
/// §3 silently, so the coordinator broadcasts its resolved `Config` at
/// startup rather than trusting each rank's local file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Number of users (`m`).
    pub n_users: u32,
    /// Number of items (`n`).
    pub n_items: u32,
    /// Factorization rank (`k`).
    pub rank: u32,
    /// Field delimiter for the rating dataset (`,` or `\t`).
    pub delimiter: char,
    /// `{}` in the path template is replaced with the rank number, e.g.
    /// `"/data/ratings_{}.csv"`.
    pub dataset_path_template: String,
    /// L2 regularization weight.
    pub lambda: f64,
    /// Step-size decay rate.
    pub decay_rate: f64,
    /// Base learning rate.
    pub learning_rate: f64,
    /// Number of times a column circulates within a machine before it is
    /// forced off-machine.
    pub n_retries: u32,
    /// Divisor applied to raw ratings read from the dataset.
    pub rating_normalizer: f64,
    /// Drop a column instead of forwarding it once a NaN is observed in its
    /// values or the W-row it touched (§4.3, §7 item 4).
    pub drop_on_nan: bool,
    /// Consecutive off-machine routing failures tolerated before a column
    /// is dropped (§4.5 Case B, §7 item 3).
    pub routing_retry_limit: u32,
    /// Coordinator loss-poll period.
    pub loss_poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_users: 138_493,
            n_items: 27_278,
            rank: 100,
            delimiter: ',',
            dataset_path_template: "ratings_{}.csv".to_string(),
            lambda: 0.05,
            decay_rate: 0.012,
            learning_rate: 1e-4,
            n_retries: 40,
            rating_normalizer: 5.0,
            drop_on_nan: false,
            routing_retry_limit: 100,
            loss_poll_interval_secs: 1,
        }
    }
}

impl Config {
    /// Loads configuration layered as: compiled defaults, then
    /// `Nomad.toml` in the current directory if present, then `NOMAD_*`
    /// environment variables (e.g. `NOMAD_LEARNING_RATE=0.0002`).
    pub fn load() -> crate::Result<Self> {
        let defaults = Self::default();
        let defaults_value = toml::Value::try_from(&defaults)
            .map_err(|e| crate::Error::Config(format!("serializing defaults: {e}")))?;

        let builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&defaults_value).map_err(|e| {
                crate::Error::Config(format!("loading defaults into layered config: {e}"))
            })?)
            .add_source(::config::File::with_name("Nomad").required(false))
            .add_source(::config::Environment::with_prefix("NOMAD"));

        let layered = builder
            .build()
            .map_err(|e| crate::Error::Config(format!("building config: {e}")))?;

        layered
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("deserializing config: {e}")))
    }

    /// Dataset path for a given rank, per the `dataset_path_template`.
    pub fn dataset_path(&self, rank: i32) -> String {
        self.dataset_path_template.replacen("{}", &rank.to_string(), 1)
    }

    /// Block size of W per worker: `B = ceil(n_users / n_workers)`.
    pub fn block_size(&self, n_workers: u32) -> u32 {
        (self.n_users + n_workers - 1) / n_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.lambda, 0.05);
        assert_eq!(cfg.decay_rate, 0.012);
        assert_eq!(cfg.learning_rate, 1e-4);
        assert_eq!(cfg.n_retries, 40);
        assert_eq!(cfg.rating_normalizer, 5.0);
    }

    #[test]
    fn dataset_path_substitutes_rank() {
        let mut cfg = Config::default();
        cfg.dataset_path_template = "/data/ratings_{}.csv".to_string();
        assert_eq!(cfg.dataset_path(3), "/data/ratings_3.csv");
    }

    #[test]
    fn block_size_rounds_up() {
        let mut cfg = Config::default();
        cfg.n_users = 10;
        assert_eq!(cfg.block_size(3), 4);
        assert_eq!(cfg.block_size(2), 5);
    }
}
