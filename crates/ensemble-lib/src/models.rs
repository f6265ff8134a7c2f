//! Core data models for the ensemble builder

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

/// Identifier of one candidate model: the training seed and its run number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId {
    pub seed: u64,
    pub run_id: u64,
}

impl ModelId {
    pub fn new(seed: u64, run_id: u64) -> Self {
        Self { seed, run_id }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.seed, self.run_id)
    }
}

/// Data split a prediction file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Held-out part of the training data used to score and combine candidates
    Ensemble,
    /// Public validation set, labels unknown
    Valid,
    /// Private test set, labels unknown
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Ensemble, Split::Valid, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Ensemble => "ensemble",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    /// Directory (relative to the work dir) holding this split's prediction files
    pub fn dir_name(&self) -> String {
        format!("predictions_{}", self.as_str())
    }

    /// File name of a candidate's prediction on this split
    pub fn file_name(&self, id: ModelId) -> String {
        format!("prediction_{}_{}_{}.npy", self.as_str(), id.seed, id.run_id)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ensemble" => Ok(Split::Ensemble),
            "valid" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            other => Err(format!("unknown split '{}'", other)),
        }
    }
}

/// Machine learning task the candidates were trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BinaryClassification,
    MulticlassClassification,
    MultilabelClassification,
    Regression,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::BinaryClassification => "binary_classification",
            TaskType::MulticlassClassification => "multiclass_classification",
            TaskType::MultilabelClassification => "multilabel_classification",
            TaskType::Regression => "regression",
        }
    }

    pub fn is_classification(&self) -> bool {
        !matches!(self, TaskType::Regression)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary_classification" | "binary.classification" => {
                Ok(TaskType::BinaryClassification)
            }
            "multiclass_classification" | "multiclass.classification" => {
                Ok(TaskType::MulticlassClassification)
            }
            "multilabel_classification" | "multilabel.classification" => {
                Ok(TaskType::MultilabelClassification)
            }
            "regression" => Ok(TaskType::Regression),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// Metric the candidates are scored with (higher is better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Accuracy,
    BalancedAccuracy,
    R2,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
            Metric::BalancedAccuracy => "balanced_accuracy",
            Metric::R2 => "r2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accuracy" | "acc_metric" => Ok(Metric::Accuracy),
            "balanced_accuracy" | "bac_metric" => Ok(Metric::BalancedAccuracy),
            "r2" | "r2_metric" => Ok(Metric::R2),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// One prediction file written by a training worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionArtifact {
    pub id: ModelId,
    pub split: Split,
    pub path: PathBuf,
    pub last_modified: SystemTime,
}

/// Normalized weight of one distinct ensemble member
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemberWeight {
    pub id: ModelId,
    pub weight: f64,
}

/// A fitted weighted combination of candidate predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    pub task: TaskType,
    pub metric: Metric,
    /// Number of greedy rounds the weights are expressed in
    pub ensemble_size: usize,
    /// Candidate pool the ensemble was fitted on, in selection order
    pub candidates: Vec<ModelId>,
    /// Greedy picks in round order; a candidate may appear several times
    pub picks: Vec<ModelId>,
    /// Distinct members in order of first pick, weights summing to 1.0
    pub members: Vec<MemberWeight>,
    /// Score of the running average after each round
    pub trajectory: Vec<f64>,
    /// SHA256 of the fitting input matrix
    pub input_hash: String,
    pub fitted_at: i64,
}

impl EnsembleModel {
    /// Number of distinct members with a non-zero weight
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn weight_of(&self, id: ModelId) -> Option<f64> {
        self.members.iter().find(|m| m.id == id).map(|m| m.weight)
    }

    /// Score of the final ensemble on the ensemble split
    pub fn final_score(&self) -> Option<f64> {
        self.trajectory.last().copied()
    }
}

impl fmt::Display for EnsembleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ensemble(size={}, members=[", self.ensemble_size)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {:.4}", m.id, m.weight)?;
        }
        write!(f, "]")?;
        if let Some(score) = self.final_score() {
            write!(f, ", {}={:.6}", self.metric, score)?;
        }
        write!(f, ")")
    }
}
