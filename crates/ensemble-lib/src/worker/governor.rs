//! Resource governor
//!
//! Runs workers under the wall-time budget and the memory ceiling. A worker that runs
//! out of memory is dropped together with its store, and a new one starts with half
//! the candidate pool. Published indices keep increasing across restarts.

use super::r#loop::remaining;
use super::{
    BuilderConfig, EnsembleWorker, LoopExit, MemoryGuard, MemorySampler, ProcessMemorySampler,
    WorkerContext,
};
use crate::health::{BuilderPhase, Component};
use crate::scoring::{scorer_for, Scorer};
use crate::store::{NpyTargetSource, TargetSource};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::debug;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Why the governor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Wall budget used up
    TimeBudget,
    MaxIterations,
    Shutdown,
    /// Memory limit exceeded with a single candidate
    MemoryFloor,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::TimeBudget => "time_budget",
            Termination::MaxIterations => "max_iterations",
            Termination::Shutdown => "shutdown",
            Termination::MemoryFloor => "memory_floor",
        }
    }

    /// True when the builder gave up rather than finished
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::MemoryFloor)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Running,
    MemoryExceeded,
    Terminated(Termination),
}

/// Summary of a governor run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorReport {
    pub termination: Termination,
    /// Workers restarted after exceeding the memory limit
    pub restarts: u32,
    pub final_n_best: usize,
    /// Number of ensembles published
    pub index_run: u64,
}

pub struct ResourceGovernor {
    config: Arc<BuilderConfig>,
    scorer: Arc<dyn Scorer>,
    targets: Arc<dyn TargetSource>,
    sampler: Arc<dyn MemorySampler>,
    ctx: WorkerContext,
    state: GovernorState,
    n_best: usize,
    restarts: u32,
    index_run: u64,
    last_used_bytes: u64,
}

impl ResourceGovernor {
    pub fn new(
        config: BuilderConfig,
        scorer: Arc<dyn Scorer>,
        targets: Arc<dyn TargetSource>,
        sampler: Arc<dyn MemorySampler>,
        ctx: WorkerContext,
    ) -> Self {
        let n_best = config.ensemble_nbest.max(1);
        Self {
            config: Arc::new(config),
            scorer,
            targets,
            sampler,
            ctx,
            state: GovernorState::Running,
            n_best,
            restarts: 0,
            index_run: 0,
            last_used_bytes: 0,
        }
    }

    /// Governor with the built-in scorer for the configured metric, targets read from
    /// the work directory and the process' resident memory as the sampler
    pub fn from_config(config: BuilderConfig, ctx: WorkerContext) -> Self {
        let scorer = scorer_for(config.metric);
        let targets = Arc::new(NpyTargetSource::new(&config.work_dir));
        Self::new(config, scorer, targets, Arc::new(ProcessMemorySampler), ctx)
    }

    pub fn state(&self) -> GovernorState {
        self.state
    }

    pub fn n_best(&self) -> usize {
        self.n_best
    }

    /// Run workers until the budget is spent, shutdown is requested or memory cannot be
    /// brought under the limit
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> GovernorReport {
        let deadline = Instant::now() + self.config.wall_budget();
        self.ctx.health.set_healthy(Component::Governor).await;

        loop {
            match self.state {
                GovernorState::Running => {
                    let exit = self.run_worker(deadline, &mut shutdown).await;
                    self.state = match exit {
                        LoopExit::Deadline => GovernorState::Terminated(Termination::TimeBudget),
                        LoopExit::MaxIterations => {
                            GovernorState::Terminated(Termination::MaxIterations)
                        }
                        LoopExit::Shutdown => GovernorState::Terminated(Termination::Shutdown),
                        LoopExit::MemoryExceeded { used_bytes } => {
                            self.last_used_bytes = used_bytes;
                            GovernorState::MemoryExceeded
                        }
                    };
                }
                GovernorState::MemoryExceeded => {
                    let used_mb = self.last_used_bytes / BYTES_PER_MB;
                    if self.n_best <= 1 {
                        self.ctx
                            .logger
                            .log_memory_floor(used_mb, self.config.memory_limit_mb);
                        self.ctx
                            .health
                            .set_unhealthy(
                                Component::Governor,
                                "Memory limit exceeded with a single candidate",
                            )
                            .await;
                        self.state = GovernorState::Terminated(Termination::MemoryFloor);
                    } else {
                        let old = self.n_best;
                        self.n_best = (self.n_best / 2).max(1);
                        self.restarts += 1;
                        self.ctx.metrics.inc_restarts();
                        self.ctx
                            .logger
                            .log_memory_degradation(old, self.n_best, used_mb);
                        self.ctx
                            .health
                            .set_degraded(
                                Component::Governor,
                                format!("Restarted with n_best {}", self.n_best),
                            )
                            .await;
                        self.state = GovernorState::Running;
                    }
                }
                GovernorState::Terminated(termination) => {
                    self.ctx
                        .health
                        .set_phase(BuilderPhase::Stopped {
                            reason: termination.as_str().to_string(),
                            failed: termination.is_failure(),
                        })
                        .await;
                    self.ctx.logger.log_terminated(
                        termination.as_str(),
                        self.index_run,
                        self.restarts,
                    );
                    return GovernorReport {
                        termination,
                        restarts: self.restarts,
                        final_n_best: self.n_best,
                        index_run: self.index_run,
                    };
                }
            }
        }
    }

    /// One worker incarnation with a fresh store and fitter
    async fn run_worker(
        &mut self,
        deadline: Instant,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> LoopExit {
        self.ctx.logger.log_worker_started(self.n_best, self.restarts);
        self.ctx.metrics.set_nbest(self.n_best);
        self.ctx
            .health
            .set_phase(BuilderPhase::Running {
                n_best: self.n_best,
                restarts: self.restarts,
            })
            .await;

        let memory = MemoryGuard::new(self.config.memory_limit_bytes(), self.sampler.clone());
        let mut worker = EnsembleWorker::new(
            self.config.clone(),
            self.n_best,
            self.index_run,
            self.scorer.clone(),
            self.targets.clone(),
            memory,
            self.ctx.clone(),
            deadline,
        );

        // The worker checks the deadline between phases; the timeout cuts a long sleep
        let exit = match timeout(remaining(deadline), worker.run(shutdown)).await {
            Ok(exit) => exit,
            Err(_) => LoopExit::Deadline,
        };
        debug!(
            exit = ?exit,
            iterations = worker.iterations(),
            index_run = worker.index_run(),
            "Worker stopped"
        );
        self.index_run = worker.index_run();
        exit
    }
}
