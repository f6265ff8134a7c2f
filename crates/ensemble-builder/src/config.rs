//! Daemon configuration
//!
//! Read from an optional `ensemble-builder.{toml,json,yaml}` file in the working
//! directory and `ENSEMBLE_*` environment variables; the environment wins.

use anyhow::{anyhow, Context, Result};
use ensemble_lib::{
    store::Precision,
    worker::BuilderConfig,
    ConfigError, Metric, TaskType,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Config file stem looked up in the working directory
const CONFIG_FILE: &str = "ensemble-builder";

/// Environment variable prefix, e.g. `ENSEMBLE_TIME_LIMIT_SECS`
const ENV_PREFIX: &str = "ENSEMBLE";

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,

    #[serde(default = "default_task")]
    pub task: String,

    #[serde(default = "default_metric")]
    pub metric: String,

    #[serde(default = "default_time_limit")]
    pub time_limit_secs: u64,

    /// 0 disables the memory check
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: usize,

    #[serde(default = "default_ensemble_nbest")]
    pub ensemble_nbest: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub read_any_seed: bool,

    /// 16, 32 or 64
    #[serde(default = "default_precision")]
    pub precision: u8,

    #[serde(default = "default_sleep_duration")]
    pub sleep_duration_ms: u64,

    /// 0 reads every new file
    #[serde(default = "default_read_at_most")]
    pub read_at_most: usize,

    #[serde(default)]
    pub max_iterations: Option<u64>,

    #[serde(default = "default_baseline_run_id")]
    pub baseline_run_id: Option<u64>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_work_dir() -> PathBuf {
    BuilderConfig::default().work_dir
}

fn default_output_dir() -> PathBuf {
    BuilderConfig::default().output_dir
}

fn default_dataset_name() -> String {
    BuilderConfig::default().dataset_name
}

fn default_task() -> String {
    BuilderConfig::default().task.to_string()
}

fn default_metric() -> String {
    BuilderConfig::default().metric.to_string()
}

fn default_time_limit() -> u64 {
    BuilderConfig::default().time_limit.as_secs()
}

fn default_memory_limit() -> u64 {
    BuilderConfig::default().memory_limit_mb
}

fn default_ensemble_size() -> usize {
    BuilderConfig::default().ensemble_size
}

fn default_ensemble_nbest() -> usize {
    BuilderConfig::default().ensemble_nbest
}

fn default_seed() -> u64 {
    BuilderConfig::default().seed
}

fn default_precision() -> u8 {
    BuilderConfig::default().precision.bits()
}

fn default_sleep_duration() -> u64 {
    BuilderConfig::default().sleep_duration.as_millis() as u64
}

fn default_read_at_most() -> usize {
    BuilderConfig::default().read_at_most
}

fn default_baseline_run_id() -> Option<u64> {
    BuilderConfig::default().baseline_run_id
}

impl DaemonConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load with an explicit config file path or stem
    pub fn load_from(file: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Validated builder configuration
    pub fn builder_config(&self) -> Result<BuilderConfig> {
        let task: TaskType = self.task.parse().map_err(|e: String| anyhow!(e))?;
        let metric: Metric = self.metric.parse().map_err(|e: String| anyhow!(e))?;
        let precision =
            Precision::from_bits(self.precision).ok_or(ConfigError::Precision(self.precision))?;

        let config = BuilderConfig {
            work_dir: self.work_dir.clone(),
            output_dir: self.output_dir.clone(),
            dataset_name: self.dataset_name.clone(),
            task,
            metric,
            time_limit: Duration::from_secs(self.time_limit_secs),
            memory_limit_mb: self.memory_limit_mb,
            ensemble_size: self.ensemble_size,
            ensemble_nbest: self.ensemble_nbest,
            seed: self.seed,
            read_any_seed: self.read_any_seed,
            precision,
            sleep_duration: Duration::from_millis(self.sleep_duration_ms),
            read_at_most: self.read_at_most,
            max_iterations: self.max_iterations,
            baseline_run_id: self.baseline_run_id,
        };
        config.validate()?;
        Ok(config)
    }
}
