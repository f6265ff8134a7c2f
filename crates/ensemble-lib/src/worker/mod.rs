//! Ensemble worker and resource governor
//!
//! The worker runs the poll, select, fit and publish cycle; the governor runs the worker
//! under the wall-time and memory budget and restarts it with a smaller candidate pool
//! when memory runs out.

mod governor;
mod memory;
mod r#loop;


pub use governor::{GovernorReport, GovernorState, ResourceGovernor, Termination};
pub use memory::{parse_vm_rss, MemoryGuard, MemorySampler, ProcessMemorySampler};
pub use r#loop::{CycleState, EnsembleWorker, LoopExit};

use crate::error::ConfigError;
use crate::health::HealthRegistry;
use crate::models::{Metric, TaskType};
use crate::observability::{EnsembleMetrics, StructuredLogger};
use crate::store::{Precision, SeedFilter, StoreConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Time reserved at the end of the budget for shutting down
pub const TIME_BUFFER: Duration = Duration::from_secs(5);

/// Everything the builder can be configured with
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Root holding the prediction directories, the targets and `ensembles/`
    pub work_dir: PathBuf,
    /// Destination of published `.predict` files
    pub output_dir: PathBuf,
    pub dataset_name: String,
    pub task: TaskType,
    pub metric: Metric,
    /// Total wall budget, including [`TIME_BUFFER`]
    pub time_limit: Duration,
    /// Memory ceiling in MB, 0 disables the check
    pub memory_limit_mb: u64,
    /// Greedy rounds per fit
    pub ensemble_size: usize,
    /// Initial cap on candidates used for fitting
    pub ensemble_nbest: usize,
    pub seed: u64,
    /// Read prediction files of every seed (shared mode)
    pub read_any_seed: bool,
    pub precision: Precision,
    /// Back-off when there is nothing to do
    pub sleep_duration: Duration,
    /// New or changed ensemble files read per refresh, 0 for no limit
    pub read_at_most: usize,
    /// Stop after this many polling iterations
    pub max_iterations: Option<u64>,
    /// Run id of the baseline model, `None` if there is none
    pub baseline_run_id: Option<u64>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            output_dir: PathBuf::from("./output"),
            dataset_name: "dataset".to_string(),
            task: TaskType::BinaryClassification,
            metric: Metric::Accuracy,
            time_limit: Duration::from_secs(3600),
            memory_limit_mb: 1000,
            ensemble_size: 10,
            ensemble_nbest: 100,
            seed: 1,
            read_any_seed: false,
            precision: Precision::Single,
            sleep_duration: Duration::from_secs(2),
            read_at_most: 5,
            max_iterations: None,
            baseline_run_id: Some(1),
        }
    }
}

impl BuilderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ensemble_size == 0 {
            return Err(ConfigError::ZeroEnsembleSize);
        }
        if self.ensemble_nbest == 0 {
            return Err(ConfigError::ZeroNBest);
        }
        if self.time_limit <= TIME_BUFFER {
            return Err(ConfigError::TimeLimitTooShort {
                limit_secs: self.time_limit.as_secs(),
                buffer_secs: TIME_BUFFER.as_secs(),
            });
        }
        Ok(())
    }

    /// Wall time the worker may use
    pub fn wall_budget(&self) -> Duration {
        self.time_limit.saturating_sub(TIME_BUFFER)
    }

    pub fn seed_filter(&self) -> SeedFilter {
        if self.read_any_seed {
            SeedFilter::Any
        } else {
            SeedFilter::Only(self.seed)
        }
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            work_dir: self.work_dir.clone(),
            seed_filter: self.seed_filter(),
            precision: self.precision,
            read_at_most: self.read_at_most,
            baseline_run_id: self.baseline_run_id,
            task: self.task,
        }
    }
}

/// Observability handles shared by the governor and every worker it starts
#[derive(Clone)]
pub struct WorkerContext {
    pub metrics: EnsembleMetrics,
    pub logger: StructuredLogger,
    pub health: HealthRegistry,
}

impl WorkerContext {
    pub fn new(config: &BuilderConfig, health: HealthRegistry) -> Self {
        Self {
            metrics: EnsembleMetrics::new(),
            logger: StructuredLogger::new(config.dataset_name.clone(), config.seed),
            health,
        }
    }
}
