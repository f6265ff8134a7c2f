//! Prediction store
//!
//! Tracks the prediction files training workers write, keyed by `(seed, run_id)`.
//! Scores and arrays are cached and only recomputed when a file's modification time
//! changes. The store is rebuilt from disk on every governor restart; it never has
//! to survive an aborted cycle.

mod array;
mod discovery;
mod targets;


pub use array::{read_matrix, read_prediction, Precision, PredictionArray};
pub use discovery::{find_artifact, parse_file_name, scan_split, SeedFilter};
pub use targets::{NpyTargetSource, TargetSource, TARGETS_FILE};

use crate::error::{StoreError, TargetError};
use crate::models::{ModelId, Split, TaskType};
use crate::scoring::Scorer;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Score recorded for candidates that were never scored or failed to score
pub const FAILED_SCORE: f64 = -1.0;

/// Configuration for the prediction store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the `predictions_<split>` directories
    pub work_dir: PathBuf,
    /// Seeds to read files for
    pub seed_filter: SeedFilter,
    /// Storage precision of cached arrays
    pub precision: Precision,
    /// New or changed ensemble files read per refresh (0 = unlimited)
    pub read_at_most: usize,
    /// Run id of the always-present baseline model
    pub baseline_run_id: Option<u64>,
    /// Task the ensemble-split predictions are scored for
    pub task: TaskType,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            seed_filter: SeedFilter::Only(1),
            precision: Precision::default(),
            read_at_most: 5,
            baseline_run_id: Some(1),
            task: TaskType::BinaryClassification,
        }
    }
}

/// Cached state of one split of a candidate
#[derive(Debug, Clone, Default)]
pub struct SplitSlot {
    /// Modification time of the file the array was read from
    pub mtime: Option<SystemTime>,
    pub array: Option<PredictionArray>,
}

impl SplitSlot {
    fn clear(&mut self) {
        self.mtime = None;
        self.array = None;
    }
}

/// The store's view of one candidate across splits
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub id: ModelId,
    /// Always-present constant predictor, only used when nothing beats it
    pub is_baseline: bool,
    /// Score on the ensemble split, [`FAILED_SCORE`] until scored successfully
    pub ensemble_score: f64,
    scored: bool,
    /// Order of first sighting, used to break score ties
    sequence: u64,
    ensemble: SplitSlot,
    valid: SplitSlot,
    test: SplitSlot,
}

impl PredictionRecord {
    fn new(id: ModelId, sequence: u64, is_baseline: bool) -> Self {
        Self {
            id,
            is_baseline,
            ensemble_score: FAILED_SCORE,
            scored: false,
            sequence,
            ensemble: SplitSlot::default(),
            valid: SplitSlot::default(),
            test: SplitSlot::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn scored(
        id: ModelId,
        sequence: u64,
        is_baseline: bool,
        score: f64,
        ensemble: Option<PredictionArray>,
    ) -> Self {
        let mut record = Self::new(id, sequence, is_baseline);
        record.ensemble_score = score;
        record.scored = true;
        record.ensemble.mtime = Some(SystemTime::UNIX_EPOCH);
        record.ensemble.array = ensemble;
        record
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True once the current ensemble file produced a score
    pub fn is_scored(&self) -> bool {
        self.scored
    }

    pub fn slot(&self, split: Split) -> &SplitSlot {
        match split {
            Split::Ensemble => &self.ensemble,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }

    fn slot_mut(&mut self, split: Split) -> &mut SplitSlot {
        match split {
            Split::Ensemble => &mut self.ensemble,
            Split::Valid => &mut self.valid,
            Split::Test => &mut self.test,
        }
    }

    pub fn array(&self, split: Split) -> Option<&PredictionArray> {
        self.slot(split).array.as_ref()
    }

    pub fn mtime(&self, split: Split) -> Option<SystemTime> {
        self.slot(split).mtime
    }

    /// Drop cached arrays; the score and ensemble mtime are kept
    /// Drop cached arrays; the ensemble mtime stays so the score is not recomputed
    pub fn evict_arrays(&mut self) {
        self.ensemble.array = None;
        self.valid.clear();
        self.test.clear();
    }

    pub fn cached_bytes(&self) -> usize {
        Split::ALL
            .iter()
            .filter_map(|s| self.array(*s))
            .map(|a| a.nbytes())
            .sum()
    }
}

/// Statistics about the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub tracked_candidates: usize,
    pub candidates_with_arrays: usize,
    pub cached_bytes: usize,
    pub files_read: u64,
    pub read_errors: u64,
}

/// Cache of candidate predictions, scores and modification times
pub struct PredictionStore {
    config: StoreConfig,
    scorer: Arc<dyn Scorer>,
    target_source: Arc<dyn TargetSource>,
    targets: Option<Array2<f64>>,
    records: HashMap<ModelId, PredictionRecord>,
    next_sequence: u64,
    files_read: u64,
    read_errors: u64,
}

impl PredictionStore {
    /// Create an empty store
    pub fn new(
        config: StoreConfig,
        scorer: Arc<dyn Scorer>,
        target_source: Arc<dyn TargetSource>,
    ) -> Self {
        Self {
            config,
            scorer,
            target_source,
            targets: None,
            records: HashMap::new(),
            next_sequence: 0,
            files_read: 0,
            read_errors: 0,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Refresh the view of the ensemble-split directory
    ///
    /// Reads and scores at most `read_at_most` new or changed files. Returns false when
    /// the targets or the prediction directory are not available yet.
    pub fn refresh(&mut self) -> bool {
        debug!("Reading ensemble split predictions");

        if self.targets.is_none() {
            match self.target_source.load_ensemble_targets() {
                Ok(targets) => self.targets = Some(targets),
                Err(TargetError::NotFound(path)) => {
                    debug!(path = %path.display(), "Ensemble targets not written yet");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ensemble targets");
                    return false;
                }
            }
        }
        let Some(targets) = self.targets.as_ref() else {
            return false;
        };

        let dir = self.config.work_dir.join(Split::Ensemble.dir_name());
        let artifacts = match scan_split(&dir, Split::Ensemble, self.config.seed_filter) {
            Ok(Some(artifacts)) => artifacts,
            Ok(None) => {
                debug!(dir = %dir.display(), "No ensemble prediction directory found");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to scan ensemble prediction directory");
                return false;
            }
        };
        if artifacts.is_empty() {
            debug!(dir = %dir.display(), "No ensemble prediction files found");
            return false;
        }

        let mut n_read = 0usize;
        for artifact in artifacts {
            // Only successful reads count, so a corrupt file cannot starve the rest
            if self.config.read_at_most > 0 && n_read >= self.config.read_at_most {
                debug!(read_at_most = self.config.read_at_most, "Read limit reached for this cycle");
                break;
            }

            let next_sequence = &mut self.next_sequence;
            let baseline_run_id = self.config.baseline_run_id;
            let record = self.records.entry(artifact.id).or_insert_with(|| {
                let sequence = *next_sequence;
                *next_sequence += 1;
                PredictionRecord::new(
                    artifact.id,
                    sequence,
                    baseline_run_id == Some(artifact.id.run_id),
                )
            });

            if record.ensemble.mtime == Some(artifact.last_modified) {
                continue;
            }

            match read_prediction(&artifact.path, self.config.precision) {
                Ok(array) => {
                    self.files_read += 1;
                    n_read += 1;

                    let scored = self
                        .scorer
                        .score(targets.view(), array.to_f64().view(), self.config.task);
                    match scored {
                        Ok(score) if score.is_finite() => {
                            record.ensemble_score = score;
                            record.scored = true;
                            record.ensemble.array = Some(array);
                            debug!(model = %artifact.id, score, "Scored ensemble prediction");
                        }
                        Ok(score) => {
                            warn!(model = %artifact.id, score, "Non-finite score for ensemble prediction");
                            record.ensemble_score = FAILED_SCORE;
                            record.scored = false;
                            record.ensemble.array = None;
                        }
                        Err(e) => {
                            warn!(model = %artifact.id, error = %e, "Failed to score ensemble prediction");
                            record.ensemble_score = FAILED_SCORE;
                            record.scored = false;
                            record.ensemble.array = None;
                        }
                    }
                    // Content is final for this mtime; a failed score is not retried
                    record.ensemble.mtime = Some(artifact.last_modified);
                }
                Err(e @ (StoreError::NonFinite { .. } | StoreError::UnsupportedShape { .. })) => {
                    // Decoded completely, so the content is final for this mtime
                    self.files_read += 1;
                    n_read += 1;
                    debug!(model = %artifact.id, error = %e, "Discarding unusable prediction");
                    record.ensemble_score = FAILED_SCORE;
                    record.scored = false;
                    record.ensemble.array = None;
                    record.ensemble.mtime = Some(artifact.last_modified);
                }
                Err(e) => {
                    // Possibly a partial write; no mtime recorded so the next refresh retries
                    self.read_errors += 1;
                    warn!(path = %artifact.path.display(), error = %e, "Error loading prediction file");
                    record.ensemble_score = FAILED_SCORE;
                    record.scored = false;
                    record.ensemble.clear();
                }
            }
        }

        true
    }

    /// Load the valid/test companions of the selected candidates
    ///
    /// Returns the candidates holding a current array for the valid and the test split
    /// respectively, whether read now or in an earlier cycle.
    pub fn fetch_companions(&mut self, selected: &[ModelId]) -> (Vec<ModelId>, Vec<ModelId>) {
        let mut valid = Vec::new();
        let mut test = Vec::new();

        for id in selected {
            if self.load_companion(*id, Split::Valid) {
                valid.push(*id);
            }
            if self.load_companion(*id, Split::Test) {
                test.push(*id);
            }
        }

        (valid, test)
    }

    fn load_companion(&mut self, id: ModelId, split: Split) -> bool {
        let artifact = find_artifact(&self.config.work_dir, split, id);
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };

        let Some(artifact) = artifact else {
            debug!(model = %id, split = %split, "Companion prediction file not found");
            record.slot_mut(split).clear();
            return false;
        };

        let slot = record.slot_mut(split);
        if slot.mtime == Some(artifact.last_modified) {
            // A recorded mtime without an array marks an unusable file
            return slot.array.is_some();
        }

        match read_prediction(&artifact.path, self.config.precision) {
            Ok(array) => {
                self.files_read += 1;
                slot.mtime = Some(artifact.last_modified);
                slot.array = Some(array);
                true
            }
            Err(e @ (StoreError::NonFinite { .. } | StoreError::UnsupportedShape { .. })) => {
                self.files_read += 1;
                debug!(model = %id, split = %split, error = %e, "Discarding unusable companion prediction");
                slot.mtime = Some(artifact.last_modified);
                slot.array = None;
                false
            }
            Err(e) => {
                self.read_errors += 1;
                warn!(path = %artifact.path.display(), error = %e, "Error loading companion prediction file");
                slot.clear();
                false
            }
        }
    }

    /// Restore evicted ensemble arrays of selected candidates
    ///
    /// Files are re-read without re-scoring when their mtime is unchanged. Returns the
    /// candidates, in input order, that hold an ensemble array afterwards.
    pub fn ensure_loaded(&mut self, ids: &[ModelId]) -> Vec<ModelId> {
        let mut loaded = Vec::with_capacity(ids.len());

        for id in ids {
            let artifact = find_artifact(&self.config.work_dir, Split::Ensemble, *id);
            let Some(record) = self.records.get_mut(id) else {
                continue;
            };
            if record.ensemble.array.is_some() {
                loaded.push(*id);
                continue;
            }

            match artifact {
                Some(artifact) if record.ensemble.mtime == Some(artifact.last_modified) => {
                    match read_prediction(&artifact.path, self.config.precision) {
                        Ok(array) => {
                            self.files_read += 1;
                            record.ensemble.array = Some(array);
                            loaded.push(*id);
                        }
                        Err(e) => {
                            self.read_errors += 1;
                            warn!(model = %id, error = %e, "Failed to reload evicted prediction");
                        }
                    }
                }
                _ => debug!(model = %id, "Evicted prediction changed on disk, waiting for rescore"),
            }
        }

        loaded
    }

    /// Targets of the ensemble split, once loaded
    pub fn targets(&self) -> Option<&Array2<f64>> {
        self.targets.as_ref()
    }

    pub fn get(&self, id: ModelId) -> Option<&PredictionRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut PredictionRecord> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of prediction files read from disk so far
    pub fn files_read(&self) -> u64 {
        self.files_read
    }

    pub fn cached_bytes(&self) -> usize {
        self.records.values().map(|r| r.cached_bytes()).sum()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            tracked_candidates: self.records.len(),
            candidates_with_arrays: self
                .records
                .values()
                .filter(|r| r.cached_bytes() > 0)
                .count(),
            cached_bytes: self.cached_bytes(),
            files_read: self.files_read,
            read_errors: self.read_errors,
        }
    }
}
