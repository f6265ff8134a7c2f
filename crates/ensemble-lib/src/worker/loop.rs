//! Polling cycle of the ensemble worker
//!
//! One iteration walks Poll -> Select -> Fit -> Publish and goes back to Poll; any
//! phase with nothing to do moves to Idle, which sleeps and polls again. Deadline,
//! memory and shutdown are checked between phases, so an iteration can be abandoned
//! at any phase boundary without leaving the store inconsistent.

use super::{BuilderConfig, MemoryGuard, WorkerContext};
use crate::ensemble::{
    narrow_to_companions, predict, select_n_best, EnsembleFitter, FitOutcome, Publisher,
};
use crate::health::Component;
use crate::models::{EnsembleModel, ModelId, Split};
use crate::scoring::Scorer;
use crate::store::{PredictionStore, TargetSource};
use ndarray::{Array2, ArrayView2};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Phase of the polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Poll,
    Select,
    Fit,
    Publish,
    Idle,
}

/// Why the worker returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Wall budget used up
    Deadline,
    /// Configured number of polling iterations done
    MaxIterations,
    Shutdown,
    MemoryExceeded { used_bytes: u64 },
}

/// Candidates chosen in the current cycle
#[derive(Debug, Default)]
struct Selection {
    /// Candidates the ensemble is fitted on
    fit: Vec<ModelId>,
    valid: Vec<ModelId>,
    test: Vec<ModelId>,
}

/// One incarnation of the builder: owns a fresh store and fitter
pub struct EnsembleWorker {
    config: Arc<BuilderConfig>,
    n_best: usize,
    store: PredictionStore,
    fitter: EnsembleFitter,
    publisher: Publisher,
    memory: MemoryGuard,
    ctx: WorkerContext,
    deadline: Instant,
    index_run: u64,
    iterations: u64,
    selection: Selection,
    pending: Option<EnsembleModel>,
    reported_reads: u64,
    reported_errors: u64,
}

impl EnsembleWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BuilderConfig>,
        n_best: usize,
        index_run: u64,
        scorer: Arc<dyn Scorer>,
        targets: Arc<dyn TargetSource>,
        memory: MemoryGuard,
        ctx: WorkerContext,
        deadline: Instant,
    ) -> Self {
        let store = PredictionStore::new(config.store_config(), scorer.clone(), targets);
        let fitter = EnsembleFitter::new(config.ensemble_size, config.task, scorer);
        let publisher = Publisher::new(
            &config.work_dir,
            &config.output_dir,
            &config.dataset_name,
            config.seed,
        );

        Self {
            config,
            n_best,
            store,
            fitter,
            publisher,
            memory,
            ctx,
            deadline,
            index_run,
            iterations: 0,
            selection: Selection::default(),
            pending: None,
            reported_reads: 0,
            reported_errors: 0,
        }
    }

    /// Index the next published ensemble will carry
    pub fn index_run(&self) -> u64 {
        self.index_run
    }

    pub fn n_best(&self) -> usize {
        self.n_best
    }

    /// Polling iterations started so far
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn store(&self) -> &PredictionStore {
        &self.store
    }

    /// Run polling cycles until the deadline, the iteration cap, shutdown or the memory limit
    pub async fn run(&mut self, shutdown: &mut broadcast::Receiver<()>) -> LoopExit {
        debug!(n_best = self.n_best, index_run = self.index_run, "Worker loop started");
        let mut state = CycleState::Poll;
        let mut cycle_start = Instant::now();

        loop {
            if let Some(exit) = self.check_limits(shutdown) {
                return exit;
            }

            state = match state {
                CycleState::Poll => {
                    if let Some(max) = self.config.max_iterations {
                        if self.iterations >= max {
                            info!(max_iterations = max, "Maximum number of iterations reached");
                            return LoopExit::MaxIterations;
                        }
                    }
                    self.iterations += 1;
                    cycle_start = Instant::now();
                    self.poll().await
                }
                CycleState::Select => self.select().await,
                CycleState::Fit => self.fit().await,
                CycleState::Publish => {
                    let next = self.publish().await;
                    self.ctx
                        .metrics
                        .observe_cycle_latency(cycle_start.elapsed().as_secs_f64());
                    next
                }
                CycleState::Idle => {
                    let nap = self
                        .config
                        .sleep_duration
                        .min(self.deadline.saturating_duration_since(Instant::now()));
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => CycleState::Poll,
                        _ = shutdown.recv() => return LoopExit::Shutdown,
                    }
                }
            };
        }
    }

    fn check_limits(&self, shutdown: &mut broadcast::Receiver<()>) -> Option<LoopExit> {
        match shutdown.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return Some(LoopExit::Shutdown),
        }
        if Instant::now() >= self.deadline {
            return Some(LoopExit::Deadline);
        }
        self.memory
            .exceeded()
            .map(|used_bytes| LoopExit::MemoryExceeded { used_bytes })
    }

    async fn poll(&mut self) -> CycleState {
        let ready = self.store.refresh();
        self.report_store().await;

        if !ready {
            self.ctx
                .health
                .set_degraded(Component::Store, "Waiting for ensemble targets or predictions")
                .await;
            return CycleState::Idle;
        }
        self.ctx.health.set_healthy(Component::Store).await;
        CycleState::Select
    }

    async fn select(&mut self) -> CycleState {
        let selected = select_n_best(self.store.records_mut(), self.n_best, self.config.seed);
        if selected.is_empty() {
            debug!("No candidates selected");
            return CycleState::Idle;
        }

        let selected = self.store.ensure_loaded(&selected);
        if selected.is_empty() {
            return CycleState::Idle;
        }

        let (valid, test) = self.store.fetch_companions(&selected);
        let fit = narrow_to_companions(&selected, &valid, &test);
        debug!(
            selected = selected.len(),
            fitting = fit.len(),
            valid = valid.len(),
            test = test.len(),
            "Selected candidates"
        );
        self.report_store().await;

        self.selection = Selection { fit, valid, test };
        CycleState::Fit
    }

    async fn fit(&mut self) -> CycleState {
        let Some(targets) = self.store.targets() else {
            return CycleState::Idle;
        };

        let mut ids = Vec::with_capacity(self.selection.fit.len());
        let mut arrays = Vec::with_capacity(self.selection.fit.len());
        for id in &self.selection.fit {
            if let Some(array) = self
                .store
                .get(*id)
                .and_then(|r| r.array(Split::Ensemble))
            {
                ids.push(*id);
                arrays.push(array.to_f64());
            }
        }
        if ids.is_empty() {
            return CycleState::Idle;
        }

        let views: Vec<ArrayView2<'_, f64>> = arrays.iter().map(|a| a.view()).collect();
        match self.fitter.fit(&ids, &views, targets.view()) {
            Ok(FitOutcome::Fitted(model)) => {
                self.ctx.metrics.inc_ensembles_fitted();
                self.ctx.logger.log_ensemble_fitted(
                    self.index_run,
                    ids.len(),
                    model.member_count(),
                    model.final_score(),
                );
                self.ctx.health.set_healthy(Component::Fitter).await;
                self.pending = Some(model);
                CycleState::Publish
            }
            Ok(FitOutcome::Unchanged) => CycleState::Idle,
            Err(e) => {
                warn!(error = %e, candidates = ids.len(), "Failed to fit ensemble");
                self.ctx.metrics.inc_fit_failures();
                self.ctx
                    .health
                    .set_degraded(Component::Fitter, e.to_string())
                    .await;
                CycleState::Idle
            }
        }
    }

    async fn publish(&mut self) -> CycleState {
        let Some(model) = self.pending.take() else {
            return CycleState::Poll;
        };
        let index_run = self.index_run;
        let mut failure = None;

        if let Err(e) = self.publisher.save_ensemble(&model, index_run) {
            warn!(error = %e, index_run, "Failed to persist ensemble");
            failure = Some(e.to_string());
        }

        for (split, available) in [
            (Split::Valid, &self.selection.valid),
            (Split::Test, &self.selection.test),
        ] {
            let arrays = member_arrays(&self.store, &model, split, available);
            let Some(values) = predict(split, &model, &arrays) else {
                continue;
            };
            match self.publisher.write_predictions(split, index_run, &values) {
                Ok(path) => {
                    self.ctx.metrics.inc_predictions_published(split);
                    self.ctx.logger.log_predictions_published(index_run, split, &path);
                }
                Err(e) => {
                    warn!(error = %e, split = %split, index_run, "Failed to write predictions");
                    failure = Some(e.to_string());
                }
            }
        }

        match failure {
            Some(message) => {
                self.ctx
                    .health
                    .set_degraded(Component::Publisher, message)
                    .await
            }
            None => self.ctx.health.set_healthy(Component::Publisher).await,
        }

        self.ctx.metrics.set_index_run(index_run);
        self.index_run += 1;
        self.ctx.health.record_published(self.index_run).await;
        CycleState::Poll
    }

    async fn report_store(&mut self) {
        let stats = self.store.stats();
        self.ctx
            .metrics
            .add_files_read(stats.files_read.saturating_sub(self.reported_reads));
        self.ctx
            .metrics
            .add_read_errors(stats.read_errors.saturating_sub(self.reported_errors));
        self.reported_reads = stats.files_read;
        self.reported_errors = stats.read_errors;
        self.ctx
            .metrics
            .set_store_size(stats.tracked_candidates, stats.cached_bytes);
        self.ctx.health.record_store(stats).await;
    }
}

/// Arrays of the fitted members that hold a prediction for `split`
fn member_arrays(
    store: &PredictionStore,
    model: &EnsembleModel,
    split: Split,
    available: &[ModelId],
) -> Vec<(ModelId, Array2<f64>)> {
    model
        .members
        .iter()
        .filter(|m| available.contains(&m.id))
        .filter_map(|m| {
            let array = store.get(m.id)?.array(split)?;
            Some((m.id, array.to_f64()))
        })
        .collect()
}

/// Time left until `deadline`
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
