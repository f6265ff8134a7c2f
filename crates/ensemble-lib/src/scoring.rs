//! Scoring capability
//!
//! The store and the fitter only see the [`Scorer`] trait. Which metric backs it is
//! decided by whoever constructs the worker; nothing in the core looks metrics up by name.

use crate::error::ScoreError;
use crate::models::{Metric, TaskType};
use ndarray::{ArrayView1, ArrayView2, Axis};
use std::sync::Arc;

/// Probability threshold for turning a single positive-class column into a label
const DECISION_THRESHOLD: f64 = 0.5;

/// Trait for scoring a prediction matrix against the ground truth
pub trait Scorer: Send + Sync {
    /// Score `prediction` against `solution`, higher is better
    fn score(
        &self,
        solution: ArrayView2<'_, f64>,
        prediction: ArrayView2<'_, f64>,
        task: TaskType,
    ) -> Result<f64, ScoreError>;

    /// Metric this scorer implements
    fn metric(&self) -> Metric;
}

/// Build the built-in scorer for a metric
pub fn scorer_for(metric: Metric) -> Arc<dyn Scorer> {
    match metric {
        Metric::Accuracy => Arc::new(Accuracy),
        Metric::BalancedAccuracy => Arc::new(BalancedAccuracy),
        Metric::R2 => Arc::new(R2),
    }
}

/// Fraction of correctly classified samples (cells, for multilabel)
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Scorer for Accuracy {
    fn score(
        &self,
        solution: ArrayView2<'_, f64>,
        prediction: ArrayView2<'_, f64>,
        task: TaskType,
    ) -> Result<f64, ScoreError> {
        check_rows(&solution, &prediction)?;

        match task {
            TaskType::Regression => Err(unsupported(self.metric(), task)),
            TaskType::MultilabelClassification => {
                check_columns(&solution, &prediction)?;
                let matches = solution
                    .iter()
                    .zip(prediction.iter())
                    .filter(|(s, p)| (**s >= DECISION_THRESHOLD) == (**p >= DECISION_THRESHOLD))
                    .count();
                Ok(matches as f64 / solution.len() as f64)
            }
            TaskType::BinaryClassification | TaskType::MulticlassClassification => {
                let truth = solution_labels(&solution)?;
                let predicted = predicted_labels(&prediction);
                let correct = truth
                    .iter()
                    .zip(predicted.iter())
                    .filter(|(t, p)| t == p)
                    .count();
                Ok(correct as f64 / truth.len() as f64)
            }
        }
    }

    fn metric(&self) -> Metric {
        Metric::Accuracy
    }
}

/// Mean per-class recall over the classes present in the solution
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancedAccuracy;

impl Scorer for BalancedAccuracy {
    fn score(
        &self,
        solution: ArrayView2<'_, f64>,
        prediction: ArrayView2<'_, f64>,
        task: TaskType,
    ) -> Result<f64, ScoreError> {
        check_rows(&solution, &prediction)?;

        match task {
            TaskType::Regression => Err(unsupported(self.metric(), task)),
            TaskType::MultilabelClassification => {
                check_columns(&solution, &prediction)?;
                let mut total = 0.0;
                for (s, p) in solution
                    .axis_iter(Axis(1))
                    .zip(prediction.axis_iter(Axis(1)))
                {
                    let truth: Vec<usize> =
                        s.iter().map(|v| (*v >= DECISION_THRESHOLD) as usize).collect();
                    let predicted: Vec<usize> =
                        p.iter().map(|v| (*v >= DECISION_THRESHOLD) as usize).collect();
                    total += mean_recall(&truth, &predicted);
                }
                Ok(total / solution.ncols() as f64)
            }
            TaskType::BinaryClassification | TaskType::MulticlassClassification => {
                let truth = solution_labels(&solution)?;
                let predicted = predicted_labels(&prediction);
                Ok(mean_recall(&truth, &predicted))
            }
        }
    }

    fn metric(&self) -> Metric {
        Metric::BalancedAccuracy
    }
}

/// Coefficient of determination, averaged over output columns
#[derive(Debug, Clone, Copy, Default)]
pub struct R2;

impl Scorer for R2 {
    fn score(
        &self,
        solution: ArrayView2<'_, f64>,
        prediction: ArrayView2<'_, f64>,
        task: TaskType,
    ) -> Result<f64, ScoreError> {
        check_rows(&solution, &prediction)?;
        if task != TaskType::Regression {
            return Err(unsupported(self.metric(), task));
        }
        check_columns(&solution, &prediction)?;

        let mut total = 0.0;
        for (s, p) in solution
            .axis_iter(Axis(1))
            .zip(prediction.axis_iter(Axis(1)))
        {
            total += r2_column(s, p)?;
        }
        Ok(total / solution.ncols() as f64)
    }

    fn metric(&self) -> Metric {
        Metric::R2
    }
}

fn r2_column(solution: ArrayView1<'_, f64>, prediction: ArrayView1<'_, f64>) -> Result<f64, ScoreError> {
    let n = solution.len() as f64;
    let mean = solution.sum() / n;
    let ss_tot: f64 = solution.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return Err(ScoreError::Degenerate("targets have zero variance".to_string()));
    }
    let ss_res: f64 = solution
        .iter()
        .zip(prediction.iter())
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Ok(1.0 - ss_res / ss_tot)
}

fn check_rows(solution: &ArrayView2<'_, f64>, prediction: &ArrayView2<'_, f64>) -> Result<(), ScoreError> {
    if solution.nrows() != prediction.nrows() {
        return Err(ScoreError::ShapeMismatch {
            solution: solution.nrows(),
            prediction: prediction.nrows(),
        });
    }
    if solution.nrows() == 0 {
        return Err(ScoreError::Degenerate("no samples".to_string()));
    }
    Ok(())
}

fn check_columns(solution: &ArrayView2<'_, f64>, prediction: &ArrayView2<'_, f64>) -> Result<(), ScoreError> {
    if solution.ncols() != prediction.ncols() {
        return Err(ScoreError::ColumnMismatch {
            solution: solution.ncols(),
            prediction: prediction.ncols(),
        });
    }
    Ok(())
}

fn unsupported(metric: Metric, task: TaskType) -> ScoreError {
    ScoreError::UnsupportedTask {
        metric: metric.to_string(),
        task: task.to_string(),
    }
}

/// Class labels from either a label column or a one-hot matrix
fn solution_labels(solution: &ArrayView2<'_, f64>) -> Result<Vec<usize>, ScoreError> {
    if solution.ncols() == 1 {
        solution
            .column(0)
            .iter()
            .map(|v| {
                if *v < 0.0 || v.fract() != 0.0 {
                    Err(ScoreError::Degenerate(format!("invalid class label {}", v)))
                } else {
                    Ok(*v as usize)
                }
            })
            .collect()
    } else {
        Ok(solution.rows().into_iter().map(argmax).collect())
    }
}

/// Predicted labels: thresholded for a single probability column, argmax otherwise
fn predicted_labels(prediction: &ArrayView2<'_, f64>) -> Vec<usize> {
    if prediction.ncols() == 1 {
        prediction
            .column(0)
            .iter()
            .map(|p| (*p >= DECISION_THRESHOLD) as usize)
            .collect()
    } else {
        prediction.rows().into_iter().map(argmax).collect()
    }
}

/// Index of the largest value, first one on ties
fn argmax(row: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (i, v) in row.iter().enumerate() {
        if *v > row[best] {
            best = i;
        }
    }
    best
}

fn mean_recall(truth: &[usize], predicted: &[usize]) -> f64 {
    let n_classes = truth.iter().copied().max().map_or(0, |m| m + 1);
    let mut support = vec![0usize; n_classes];
    let mut hits = vec![0usize; n_classes];
    for (t, p) in truth.iter().zip(predicted.iter()) {
        support[*t] += 1;
        if t == p {
            hits[*t] += 1;
        }
    }

    let recalls: Vec<f64> = support
        .iter()
        .zip(hits.iter())
        .filter(|(s, _)| **s > 0)
        .map(|(s, h)| *h as f64 / *s as f64)
        .collect();
    recalls.iter().sum::<f64>() / recalls.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_accuracy_binary_single_column() {
        let solution = array![[0.0], [1.0], [1.0], [0.0]];
        let prediction = array![[0.2], [0.7], [0.4], [0.1]];
        let score = Accuracy
            .score(solution.view(), prediction.view(), TaskType::BinaryClassification)
            .unwrap();
        assert!((score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_multiclass_argmax() {
        let solution = array![[0.0], [2.0], [1.0]];
        let prediction = array![[0.6, 0.3, 0.1], [0.1, 0.1, 0.8], [0.5, 0.4, 0.1]];
        let score = Accuracy
            .score(solution.view(), prediction.view(), TaskType::MulticlassClassification)
            .unwrap();
        assert!((score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_row_mismatch() {
        let solution = array![[0.0], [1.0]];
        let prediction = array![[0.2]];
        let err = Accuracy
            .score(solution.view(), prediction.view(), TaskType::BinaryClassification)
            .unwrap_err();
        assert_eq!(err, ScoreError::ShapeMismatch { solution: 2, prediction: 1 });
    }

    #[test]
    fn test_balanced_accuracy_imbalanced() {
        // Always predicting class 0: recall 1.0 on class 0, 0.0 on class 1
        let solution = array![[0.0], [0.0], [0.0], [1.0]];
        let prediction = array![[0.9, 0.1], [0.9, 0.1], [0.9, 0.1], [0.9, 0.1]];
        let score = BalancedAccuracy
            .score(solution.view(), prediction.view(), TaskType::BinaryClassification)
            .unwrap();
        assert!((score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_r2_perfect_and_degenerate() {
        let solution = array![[1.0], [2.0], [3.0]];
        let score = R2
            .score(solution.view(), solution.view(), TaskType::Regression)
            .unwrap();
        assert!((score - 1.0).abs() < 1e-12);

        let flat = array![[2.0], [2.0], [2.0]];
        let err = R2
            .score(flat.view(), solution.view(), TaskType::Regression)
            .unwrap_err();
        assert!(matches!(err, ScoreError::Degenerate(_)));
    }

    #[test]
    fn test_metric_task_compatibility() {
        let solution = array![[1.0], [2.0]];
        assert!(matches!(
            Accuracy.score(solution.view(), solution.view(), TaskType::Regression),
            Err(ScoreError::UnsupportedTask { .. })
        ));
        assert_eq!(scorer_for(Metric::R2).metric(), Metric::R2);
    }
}
