//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use rand::Rng;
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    //////////////////////////////////////////////////////////////////////////
    // Reconciler Config /////////////////////////////////////////////////////
    /// The duration in milliseconds which the reconciler waits before retrying unfinished work.
    #[serde(default = "Config::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// The upper bound in milliseconds of random jitter added to each retry interval.
    ///
    /// This helps to avoid synchronized retries when many nodes change state together.
    #[serde(default)]
    pub retry_jitter_ms: u64,
    /// The capacity of the intake queue of membership events.
    #[serde(default = "Config::default_intake_queue_capacity")]
    pub intake_queue_capacity: usize,
    /// The maximum number of move requests or progress queries issued concurrently per update.
    #[serde(default = "Config::default_max_concurrent_moves")]
    pub max_concurrent_moves: usize,
    /// Rebalance replicas onto nodes which join the cluster.
    #[serde(default)]
    pub rebalance_on_join: bool,

    //////////////////////////////////////////////////////////////////////////
    // Simulator Config //////////////////////////////////////////////////////
    /// The path to the scenario file used by the simulator.
    #[serde(default = "Config::default_scenario_path")]
    pub scenario_path: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the values of this config.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.retry_interval_ms >= 1, "retry_interval_ms must be at least 1");
        ensure!(self.intake_queue_capacity >= 1, "intake_queue_capacity must be at least 1");
        ensure!(self.max_concurrent_moves >= 1, "max_concurrent_moves must be at least 1");
        Ok(())
    }

    /// The base retry interval of the reconciler.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// The delay to use before the next retry, including any configured jitter.
    pub fn retry_delay(&self) -> Duration {
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.retry_jitter_ms)
        };
        self.retry_interval() + Duration::from_millis(jitter)
    }

    fn default_retry_interval_ms() -> u64 {
        5_000
    }

    fn default_intake_queue_capacity() -> usize {
        1_000
    }

    fn default_max_concurrent_moves() -> usize {
        32
    }

    fn default_scenario_path() -> String {
        "scenario.yaml".into()
    }

    /// Create a config for use in tests, with a short retry interval.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: "error".into(),
            retry_interval_ms: 10,
            retry_jitter_ms: 0,
            intake_queue_capacity: 100,
            max_concurrent_moves: 4,
            rebalance_on_join: false,
            scenario_path: Self::default_scenario_path(),
        })
    }
}
