//! Ensemble construction
//!
//! Ranks scored candidates, fits a weighted combination of the best ones and publishes
//! the combined predictions for the valid and test splits.

mod fitter;
mod output;
mod selector;

pub use fitter::{
    greedy_selection, input_hash, pick_weights, stack_predictions, EnsembleFitter, FitOutcome,
    GreedyResult,
};
pub use output::{
    ensemble_file_path, format_matrix, list_ensembles, list_predictions, load_ensemble,
    parse_ensemble_file_name, parse_prediction_file_name, predict, PersistedEnsemble,
    PublishedPrediction, Publisher, ENSEMBLES_DIR,
};
pub use selector::{narrow_to_companions, select_n_best, RANDOM_SCORE_THRESHOLD};
