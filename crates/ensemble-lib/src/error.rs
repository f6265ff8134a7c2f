//! Error types for the ensemble builder
//!
//! Everything here is contained by the worker loop: a failing file, score or fit is
//! logged and skipped for the cycle. Only resource-ceiling breaches leave the loop.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to load one prediction file
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("{} contains non-finite values", .path.display())]
    NonFinite { path: PathBuf },

    #[error("{} has unsupported rank {ndim} (expected 1 or 2)", .path.display())]
    UnsupportedShape { path: PathBuf, ndim: usize },
}

/// Failure to obtain the ensemble-split ground truth
#[derive(Error, Debug)]
pub enum TargetError {
    /// Training has not written the targets yet
    #[error("ensemble targets not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load ensemble targets: {0}")]
    Load(#[from] StoreError),
}

/// Failure of the injected scoring capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("solution has {solution} rows but prediction has {prediction}")]
    ShapeMismatch { solution: usize, prediction: usize },

    #[error("solution has {solution} columns but prediction has {prediction}")]
    ColumnMismatch { solution: usize, prediction: usize },

    #[error("degenerate input: {0}")]
    Degenerate(String),

    #[error("metric {metric} does not support task {task}")]
    UnsupportedTask { metric: String, task: String },
}

/// Failure to fit an ensemble
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("no candidates to fit an ensemble on")]
    EmptyPool,

    #[error("ensemble size must be at least 1")]
    ZeroEnsembleSize,

    #[error("candidate {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("scoring failed during greedy round {round}: {source}")]
    Score {
        round: usize,
        #[source]
        source: ScoreError,
    },

    #[error("no candidate produced a finite score in greedy round {0}")]
    NoFiniteScore(usize),
}

/// Failure to write published predictions or to persist an ensemble
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ensemble JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid builder configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("ensemble_size must be at least 1")]
    ZeroEnsembleSize,

    #[error("ensemble_nbest must be at least 1")]
    ZeroNBest,

    #[error("time limit of {limit_secs}s does not exceed the {buffer_secs}s shutdown buffer")]
    TimeLimitTooShort { limit_secs: u64, buffer_secs: u64 },

    #[error("unsupported precision {0}, expected 16, 32 or 64")]
    Precision(u8),
}
