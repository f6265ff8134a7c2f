//! Observability infrastructure for the ensemble builder
//!
//! Provides:
//! - Prometheus metrics (files read, fits, publishes, restarts, cache size, cycle latency)
//! - Structured lifecycle events with tracing

use crate::models::Split;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for one polling cycle (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EnsembleMetricsInner> = OnceLock::new();

struct EnsembleMetricsInner {
    files_read: IntCounter,
    read_errors: IntCounter,
    ensembles_fitted: IntCounter,
    fit_failures: IntCounter,
    predictions_published: IntCounterVec,
    restarts: IntCounter,
    nbest_cap: IntGauge,
    cached_bytes: IntGauge,
    tracked_candidates: IntGauge,
    index_run: IntGauge,
    cycle_latency_seconds: Histogram,
}

impl EnsembleMetricsInner {
    fn new() -> Self {
        Self {
            files_read: register_int_counter!(
                "ensemble_builder_files_read_total",
                "Prediction files read from disk"
            )
            .expect("Failed to register files_read"),

            read_errors: register_int_counter!(
                "ensemble_builder_read_errors_total",
                "Prediction files that could not be read or decoded"
            )
            .expect("Failed to register read_errors"),

            ensembles_fitted: register_int_counter!(
                "ensemble_builder_ensembles_fitted_total",
                "Ensembles fitted by greedy selection"
            )
            .expect("Failed to register ensembles_fitted"),

            fit_failures: register_int_counter!(
                "ensemble_builder_fit_failures_total",
                "Fitting attempts that produced no ensemble"
            )
            .expect("Failed to register fit_failures"),

            predictions_published: register_int_counter_vec!(
                "ensemble_builder_predictions_published_total",
                "Ensemble prediction files written",
                &["split"]
            )
            .expect("Failed to register predictions_published"),

            restarts: register_int_counter!(
                "ensemble_builder_restarts_total",
                "Worker restarts after exceeding the memory limit"
            )
            .expect("Failed to register restarts"),

            nbest_cap: register_int_gauge!(
                "ensemble_builder_nbest",
                "Current cap on candidates used for fitting"
            )
            .expect("Failed to register nbest_cap"),

            cached_bytes: register_int_gauge!(
                "ensemble_builder_cached_bytes",
                "Bytes of prediction arrays held in the store"
            )
            .expect("Failed to register cached_bytes"),

            tracked_candidates: register_int_gauge!(
                "ensemble_builder_tracked_candidates",
                "Candidates known to the store"
            )
            .expect("Failed to register tracked_candidates"),

            index_run: register_int_gauge!(
                "ensemble_builder_index_run",
                "Index of the most recently published ensemble"
            )
            .expect("Failed to register index_run"),

            cycle_latency_seconds: register_histogram!(
                "ensemble_builder_cycle_latency_seconds",
                "Time spent in one poll, select, fit and publish cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),
        }
    }
}

/// Builder metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same metrics.
#[derive(Clone)]
pub struct EnsembleMetrics {
    _private: (),
}

impl Default for EnsembleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EnsembleMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EnsembleMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EnsembleMetricsInner {
        GLOBAL_METRICS.get_or_init(EnsembleMetricsInner::new)
    }

    pub fn add_files_read(&self, n: u64) {
        self.inner().files_read.inc_by(n);
    }

    pub fn add_read_errors(&self, n: u64) {
        self.inner().read_errors.inc_by(n);
    }

    pub fn inc_ensembles_fitted(&self) {
        self.inner().ensembles_fitted.inc();
    }

    pub fn inc_fit_failures(&self) {
        self.inner().fit_failures.inc();
    }

    pub fn inc_predictions_published(&self, split: Split) {
        self.inner()
            .predictions_published
            .with_label_values(&[split.as_str()])
            .inc();
    }

    pub fn inc_restarts(&self) {
        self.inner().restarts.inc();
    }

    pub fn set_nbest(&self, n_best: usize) {
        self.inner().nbest_cap.set(n_best as i64);
    }

    /// Update the store size gauges
    pub fn set_store_size(&self, tracked: usize, cached_bytes: usize) {
        self.inner().tracked_candidates.set(tracked as i64);
        self.inner().cached_bytes.set(cached_bytes as i64);
    }

    pub fn set_index_run(&self, index_run: u64) {
        self.inner().index_run.set(index_run as i64);
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for builder lifecycle events
///
/// Every event carries an `event` field and the builder identity.
#[derive(Clone)]
pub struct StructuredLogger {
    dataset: String,
    seed: u64,
}

impl StructuredLogger {
    pub fn new(dataset: impl Into<String>, seed: u64) -> Self {
        Self {
            dataset: dataset.into(),
            seed,
        }
    }

    pub fn log_startup(&self, version: &str, n_best: usize, ensemble_size: usize) {
        info!(
            event = "builder_started",
            dataset = %self.dataset,
            seed = self.seed,
            builder_version = %version,
            n_best = n_best,
            ensemble_size = ensemble_size,
            "Ensemble builder started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "builder_shutdown",
            dataset = %self.dataset,
            seed = self.seed,
            reason = %reason,
            "Ensemble builder shutting down"
        );
    }

    pub fn log_worker_started(&self, n_best: usize, restart: u32) {
        info!(
            event = "worker_started",
            dataset = %self.dataset,
            seed = self.seed,
            n_best = n_best,
            restart = restart,
            "Starting ensemble worker"
        );
    }

    pub fn log_ensemble_fitted(
        &self,
        index_run: u64,
        candidates: usize,
        members: usize,
        score: Option<f64>,
    ) {
        info!(
            event = "ensemble_fitted",
            dataset = %self.dataset,
            seed = self.seed,
            index_run = index_run,
            candidates = candidates,
            members = members,
            score = ?score,
            "Fitted ensemble"
        );
    }

    pub fn log_predictions_published(&self, index_run: u64, split: Split, path: &Path) {
        info!(
            event = "predictions_published",
            dataset = %self.dataset,
            seed = self.seed,
            index_run = index_run,
            split = %split,
            path = %path.display(),
            "Published ensemble predictions"
        );
    }

    /// Memory limit hit, retrying with a smaller candidate pool
    pub fn log_memory_degradation(&self, old_n_best: usize, new_n_best: usize, used_mb: u64) {
        warn!(
            event = "memory_exceeded",
            dataset = %self.dataset,
            seed = self.seed,
            old_n_best = old_n_best,
            new_n_best = new_n_best,
            used_mb = used_mb,
            "Memory limit exceeded, restarting with fewer candidates"
        );
    }

    /// Memory limit hit with nothing left to shed
    pub fn log_memory_floor(&self, used_mb: u64, limit_mb: u64) {
        error!(
            event = "memory_floor",
            critical = true,
            dataset = %self.dataset,
            seed = self.seed,
            used_mb = used_mb,
            limit_mb = limit_mb,
            "Memory limit exceeded with a single candidate, giving up"
        );
    }

    pub fn log_terminated(&self, reason: &str, index_run: u64, restarts: u32) {
        info!(
            event = "builder_terminated",
            dataset = %self.dataset,
            seed = self.seed,
            reason = %reason,
            index_run = index_run,
            restarts = restarts,
            "Ensemble builder finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensemble_metrics_creation() {
        // Registration goes to the global registry, so handles can be created repeatedly
        let metrics = EnsembleMetrics::new();
        let again = EnsembleMetrics::new();

        metrics.add_files_read(3);
        metrics.add_read_errors(1);
        metrics.inc_ensembles_fitted();
        metrics.inc_predictions_published(Split::Valid);
        again.set_nbest(50);
        again.set_store_size(10, 4096);
        again.observe_cycle_latency(0.02);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "ensemble_builder_predictions_published_total"));
    }

    #[test]
    fn test_structured_logger_identity() {
        let logger = StructuredLogger::new("iris", 4);
        assert_eq!(logger.dataset, "iris");
        assert_eq!(logger.seed, 4);
    }
}
