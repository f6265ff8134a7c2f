//! Greedy forward ensemble selection
//!
//! Each round adds (with replacement) the candidate whose inclusion gives the best score
//! for the running average. Weights are pick counts divided by the ensemble size, so
//! they are multiples of `1/ensemble_size` and sum to one.

use crate::error::FitError;
use crate::models::{EnsembleModel, MemberWeight, ModelId, TaskType};
use crate::scoring::Scorer;
use ndarray::{stack, Array2, Array3, ArrayView2, ArrayView3, Axis};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of one fitting attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// A new ensemble was fitted
    Fitted(EnsembleModel),
    /// Input is byte-identical to the last successful fit
    Unchanged,
}

/// Picks and per-round scores of a greedy run
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyResult {
    /// Chosen candidate index per round
    pub picks: Vec<usize>,
    /// Score of the running average after each round
    pub trajectory: Vec<f64>,
}

/// Fits ensembles and remembers the input of the last successful fit
pub struct EnsembleFitter {
    ensemble_size: usize,
    task: TaskType,
    scorer: Arc<dyn Scorer>,
    last_hash: Option<String>,
}

impl EnsembleFitter {
    pub fn new(ensemble_size: usize, task: TaskType, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            ensemble_size,
            task,
            scorer,
            last_hash: None,
        }
    }

    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Hash of the input the current ensemble was fitted on
    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Fit an ensemble over `candidates`, whose ensemble-split predictions are `predictions`
    ///
    /// Returns [`FitOutcome::Unchanged`] without fitting when the stacked input hashes to
    /// the same value as the last successful fit. A failed fit leaves that hash untouched.
    pub fn fit(
        &mut self,
        candidates: &[ModelId],
        predictions: &[ArrayView2<'_, f64>],
        targets: ArrayView2<'_, f64>,
    ) -> Result<FitOutcome, FitError> {
        if self.ensemble_size == 0 {
            return Err(FitError::ZeroEnsembleSize);
        }
        if candidates.is_empty() || candidates.len() != predictions.len() {
            return Err(FitError::EmptyPool);
        }

        let stacked = stack_predictions(predictions)?;
        let hash = input_hash(&stacked);
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            debug!(candidates = candidates.len(), "Fitting input unchanged, skipping fit");
            return Ok(FitOutcome::Unchanged);
        }

        let result = greedy_selection(
            stacked.view(),
            targets,
            self.ensemble_size,
            self.task,
            self.scorer.as_ref(),
        )?;

        let picks: Vec<ModelId> = result.picks.iter().map(|i| candidates[*i]).collect();
        let members = pick_weights(&picks, self.ensemble_size);

        let model = EnsembleModel {
            task: self.task,
            metric: self.scorer.metric(),
            ensemble_size: self.ensemble_size,
            candidates: candidates.to_vec(),
            picks,
            members,
            trajectory: result.trajectory,
            input_hash: hash.clone(),
            fitted_at: chrono::Utc::now().timestamp(),
        };

        info!(
            members = model.member_count(),
            candidates = candidates.len(),
            score = model.final_score().unwrap_or(f64::NAN),
            "Fitted ensemble"
        );
        self.last_hash = Some(hash);
        Ok(FitOutcome::Fitted(model))
    }
}

/// Stack equally shaped prediction matrices into `[k, n_samples, n_outputs]`
pub fn stack_predictions(predictions: &[ArrayView2<'_, f64>]) -> Result<Array3<f64>, FitError> {
    let first = predictions.first().ok_or(FitError::EmptyPool)?;
    let expected = first.dim();
    for (index, p) in predictions.iter().enumerate() {
        if p.dim() != expected {
            return Err(FitError::ShapeMismatch {
                index,
                expected,
                found: p.dim(),
            });
        }
    }

    stack(Axis(0), predictions).map_err(|_| FitError::ShapeMismatch {
        index: 0,
        expected,
        found: expected,
    })
}

/// SHA256 over the shape and the little-endian values of the stacked input
pub fn input_hash(stacked: &Array3<f64>) -> String {
    let mut hasher = Sha256::new();
    for d in stacked.shape() {
        hasher.update((*d as u64).to_le_bytes());
    }
    for v in stacked.iter() {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Greedy forward selection with replacement
///
/// Ties on a round's score go to the lowest candidate index. Candidates whose
/// average yields a non-finite score are skipped for that round.
pub fn greedy_selection(
    predictions: ArrayView3<'_, f64>,
    targets: ArrayView2<'_, f64>,
    ensemble_size: usize,
    task: TaskType,
    scorer: &dyn Scorer,
) -> Result<GreedyResult, FitError> {
    let (k, n_samples, n_outputs) = predictions.dim();
    if k == 0 {
        return Err(FitError::EmptyPool);
    }
    if ensemble_size == 0 {
        return Err(FitError::ZeroEnsembleSize);
    }

    let mut running = Array2::<f64>::zeros((n_samples, n_outputs));
    let mut picks = Vec::with_capacity(ensemble_size);
    let mut trajectory = Vec::with_capacity(ensemble_size);

    for round in 0..ensemble_size {
        let size = (round + 1) as f64;
        let mut best: Option<(usize, f64)> = None;

        for (index, candidate) in predictions.axis_iter(Axis(0)).enumerate() {
            let averaged = (&running + &candidate) / size;
            let score = scorer
                .score(targets, averaged.view(), task)
                .map_err(|source| FitError::Score { round, source })?;
            if !score.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((index, score));
            }
        }

        let (index, score) = best.ok_or(FitError::NoFiniteScore(round))?;
        running += &predictions.index_axis(Axis(0), index);
        picks.push(index);
        trajectory.push(score);
    }

    Ok(GreedyResult { picks, trajectory })
}

/// Weight per distinct pick, in order of first pick
pub fn pick_weights(picks: &[ModelId], ensemble_size: usize) -> Vec<MemberWeight> {
    let mut counts: Vec<(ModelId, usize)> = Vec::new();
    for id in picks {
        match counts.iter_mut().find(|(m, _)| m == id) {
            Some((_, count)) => *count += 1,
            None => counts.push((*id, 1)),
        }
    }

    counts
        .into_iter()
        .map(|(id, count)| MemberWeight {
            id,
            weight: count as f64 / ensemble_size as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoreError;
    use crate::models::Metric;
    use crate::scoring::{Accuracy, R2};
    use ndarray::array;

    /// Negative mean absolute error, so ties are easy to construct
    struct NegMae;

    impl Scorer for NegMae {
        fn score(
            &self,
            solution: ArrayView2<'_, f64>,
            prediction: ArrayView2<'_, f64>,
            _task: TaskType,
        ) -> Result<f64, ScoreError> {
            let diff = &solution - &prediction;
            Ok(-diff.mapv(f64::abs).mean().unwrap_or(0.0))
        }

        fn metric(&self) -> Metric {
            Metric::R2
        }
    }

    fn ids(n: u64) -> Vec<ModelId> {
        (2..2 + n).map(|r| ModelId::new(1, r)).collect()
    }

    #[test]
    fn test_weights_are_normalized_multiples() {
        let targets = array![[0.0], [1.0], [1.0], [0.0]];
        let a = array![[0.4], [0.6], [0.4], [0.4]];
        let b = array![[0.6], [0.6], [0.6], [0.6]];
        let c = array![[0.1], [0.9], [0.6], [0.2]];

        let mut fitter = EnsembleFitter::new(7, TaskType::BinaryClassification, Arc::new(Accuracy));
        let outcome = fitter
            .fit(&ids(3), &[a.view(), b.view(), c.view()], targets.view())
            .unwrap();
        let FitOutcome::Fitted(model) = outcome else {
            panic!("expected a fitted ensemble");
        };

        let total: f64 = model.members.iter().map(|m| m.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        for m in &model.members {
            let multiple = m.weight * 7.0;
            assert!((multiple - multiple.round()).abs() < 1e-9);
        }
        assert_eq!(model.picks.len(), 7);
        // c classifies everything correctly and is picked first
        assert_eq!(model.picks[0], ModelId::new(1, 4));
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let targets = array![[1.0], [1.0]];
        let same = array![[0.5], [0.5]];

        let result = greedy_selection(
            stack_predictions(&[same.view(), same.view(), same.view()])
                .unwrap()
                .view(),
            targets.view(),
            3,
            TaskType::Regression,
            &NegMae,
        )
        .unwrap();
        assert_eq!(result.picks, vec![0, 0, 0]);

        let again = greedy_selection(
            stack_predictions(&[same.view(), same.view(), same.view()])
                .unwrap()
                .view(),
            targets.view(),
            3,
            TaskType::Regression,
            &NegMae,
        )
        .unwrap();
        assert_eq!(again, result);
    }

    #[test]
    fn test_repicks_to_reach_weighted_average() {
        // Target 0.75 is reached by picking `high` three times and `low` once
        let targets = array![[0.75]];
        let low = array![[0.0]];
        let high = array![[1.0]];

        let result = greedy_selection(
            stack_predictions(&[low.view(), high.view()]).unwrap().view(),
            targets.view(),
            4,
            TaskType::Regression,
            &NegMae,
        )
        .unwrap();
        assert_eq!(result.picks, vec![1, 0, 1, 1]);
        assert!((result.trajectory[3] - 0.0).abs() < 1e-12);

        let weights = pick_weights(&[ModelId::new(1, 3), ModelId::new(1, 2), ModelId::new(1, 3), ModelId::new(1, 3)], 4);
        assert_eq!(weights[0].id, ModelId::new(1, 3));
        assert!((weights[0].weight - 0.75).abs() < 1e-12);
        assert!((weights[1].weight - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_identical_input_is_unchanged() {
        let targets = array![[0.0], [1.0]];
        let a = array![[0.2], [0.9]];
        let b = array![[0.6], [0.4]];
        let mut fitter = EnsembleFitter::new(3, TaskType::BinaryClassification, Arc::new(Accuracy));

        let first = fitter.fit(&ids(2), &[a.view(), b.view()], targets.view()).unwrap();
        assert!(matches!(first, FitOutcome::Fitted(_)));
        let hash = fitter.last_hash().map(str::to_string);

        let second = fitter.fit(&ids(2), &[a.view(), b.view()], targets.view()).unwrap();
        assert_eq!(second, FitOutcome::Unchanged);
        assert_eq!(fitter.last_hash().map(str::to_string), hash);

        let changed = array![[0.1], [0.9]];
        let third = fitter
            .fit(&ids(2), &[changed.view(), b.view()], targets.view())
            .unwrap();
        assert!(matches!(third, FitOutcome::Fitted(_)));
    }

    #[test]
    fn test_degenerate_input_fails_without_updating_hash() {
        // Zero-variance regression targets cannot be scored
        let targets = array![[1.0], [1.0]];
        let a = array![[1.0], [1.0]];
        let mut fitter = EnsembleFitter::new(2, TaskType::Regression, Arc::new(R2));

        let err = fitter.fit(&ids(1), &[a.view()], targets.view()).unwrap_err();
        assert!(matches!(err, FitError::Score { round: 0, .. }));
        assert!(fitter.last_hash().is_none());
    }

    #[test]
    fn test_shape_mismatch_and_empty_pool() {
        let a = array![[0.1, 0.9]];
        let b = array![[0.1, 0.9], [0.5, 0.5]];
        assert_eq!(
            stack_predictions(&[a.view(), b.view()]).unwrap_err(),
            FitError::ShapeMismatch {
                index: 1,
                expected: (1, 2),
                found: (2, 2)
            }
        );
        assert_eq!(stack_predictions(&[]).unwrap_err(), FitError::EmptyPool);
    }

    #[test]
    fn test_hash_covers_shape() {
        let flat = Array3::<f64>::zeros((1, 2, 2));
        let tall = Array3::<f64>::zeros((1, 4, 1));
        assert_ne!(input_hash(&flat), input_hash(&tall));
        assert_eq!(input_hash(&flat), input_hash(&flat.clone()));
    }
}
