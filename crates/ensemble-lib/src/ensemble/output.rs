//! Ensemble prediction and publishing
//!
//! Applies fitted weights to valid/test predictions and writes the results, plus the
//! fitted ensemble itself, to disk. Every file is written to a temporary path and
//! renamed into place so readers never observe a partial write.

use crate::error::PublishError;
use crate::models::{EnsembleModel, ModelId, Split, TaskType};
use ndarray::{s, Array2};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory (relative to the work dir) holding persisted ensembles
pub const ENSEMBLES_DIR: &str = "ensembles";

const ENSEMBLE_EXTENSION: &str = "ensemble";
const PREDICT_EXTENSION: &str = "predict";

/// Combine member predictions with the fitted weights
///
/// Returns `None` unless exactly one array per distinct fitted member is supplied and
/// all arrays have the same shape. For binary tasks with two output columns only the
/// positive-class column is kept.
pub fn predict(
    split: Split,
    model: &EnsembleModel,
    arrays: &[(ModelId, Array2<f64>)],
) -> Option<Array2<f64>> {
    if arrays.len() != model.member_count() {
        debug!(
            split = %split,
            arrays = arrays.len(),
            members = model.member_count(),
            "Member count mismatch, not predicting"
        );
        return None;
    }

    let (_, first) = arrays.first()?;
    let shape = first.dim();
    let mut combined = Array2::<f64>::zeros(shape);
    for (id, array) in arrays {
        let Some(weight) = model.weight_of(*id) else {
            debug!(split = %split, model = %id, "Array supplied for a non-member");
            return None;
        };
        if array.dim() != shape {
            debug!(split = %split, model = %id, "Member arrays differ in shape");
            return None;
        }
        combined.scaled_add(weight, array);
    }

    if model.task == TaskType::BinaryClassification && combined.ncols() == 2 {
        combined = combined.slice(s![.., 1..2]).to_owned();
    }
    Some(combined)
}

/// Render a matrix as whitespace-delimited text, one row per line
pub fn format_matrix(values: &Array2<f64>) -> String {
    let mut out = String::new();
    for row in values.rows() {
        for (i, v) in row.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}", v);
        }
        out.push('\n');
    }
    out
}

/// A persisted ensemble found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEnsemble {
    pub seed: u64,
    pub index_run: u64,
    pub path: PathBuf,
}

/// A published prediction file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPrediction {
    pub dataset: String,
    pub split: Split,
    pub index_run: u64,
    pub path: PathBuf,
}

/// Writes ensemble predictions and persists fitted ensembles
#[derive(Debug, Clone)]
pub struct Publisher {
    output_dir: PathBuf,
    work_dir: PathBuf,
    dataset_name: String,
    seed: u64,
}

impl Publisher {
    pub fn new(work_dir: &Path, output_dir: &Path, dataset_name: &str, seed: u64) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            dataset_name: dataset_name.to_string(),
            seed,
        }
    }

    /// `<output_dir>/<dataset>_<split>_<index_run:03>.predict`
    pub fn prediction_path(&self, split: Split, index_run: u64) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_{:03}.{}",
            self.dataset_name,
            split.as_str(),
            index_run,
            PREDICT_EXTENSION
        ))
    }

    pub fn ensemble_path(&self, index_run: u64) -> PathBuf {
        ensemble_file_path(&self.work_dir, self.seed, index_run)
    }

    pub fn write_predictions(
        &self,
        split: Split,
        index_run: u64,
        values: &Array2<f64>,
    ) -> Result<PathBuf, PublishError> {
        let path = self.prediction_path(split, index_run);
        write_atomic(&path, format_matrix(values).as_bytes())?;
        debug!(path = %path.display(), split = %split, index_run, "Wrote ensemble predictions");
        Ok(path)
    }

    pub fn save_ensemble(
        &self,
        model: &EnsembleModel,
        index_run: u64,
    ) -> Result<PathBuf, PublishError> {
        let path = self.ensemble_path(index_run);
        let json = serde_json::to_vec_pretty(model)?;
        write_atomic(&path, &json)?;
        debug!(path = %path.display(), index_run, "Persisted ensemble");
        Ok(path)
    }
}

/// Write to a temporary sibling, sync, then rename into place
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PublishError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| PublishError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path).map_err(io_err(&temp_path))?;
    file.write_all(contents).map_err(io_err(&temp_path))?;
    file.sync_all().map_err(io_err(&temp_path))?;

    fs::rename(&temp_path, path).map_err(io_err(path))
}

/// `<work_dir>/ensembles/<seed>.<index_run:010>.ensemble`
pub fn ensemble_file_path(work_dir: &Path, seed: u64, index_run: u64) -> PathBuf {
    work_dir
        .join(ENSEMBLES_DIR)
        .join(format!("{}.{:010}.{}", seed, index_run, ENSEMBLE_EXTENSION))
}

/// Load a persisted ensemble
pub fn load_ensemble(path: &Path) -> Result<EnsembleModel, PublishError> {
    let bytes = fs::read(path).map_err(|source| PublishError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Parse `<seed>.<index_run>.ensemble`
pub fn parse_ensemble_file_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".ensemble")?;
    let (seed, index_run) = stem.split_once('.')?;
    Some((seed.parse().ok()?, index_run.parse().ok()?))
}

/// Parse `<dataset>_<split>_<index_run>.predict`; the dataset name may contain underscores
pub fn parse_prediction_file_name(name: &str) -> Option<(String, Split, u64)> {
    let stem = name.strip_suffix(".predict")?;
    let (rest, index_run) = stem.rsplit_once('_')?;
    let (dataset, split) = rest.rsplit_once('_')?;
    if dataset.is_empty() {
        return None;
    }
    Some((dataset.to_string(), split.parse().ok()?, index_run.parse().ok()?))
}

/// List persisted ensembles under `<work_dir>/ensembles`, ordered by seed and index
pub fn list_ensembles(work_dir: &Path) -> Result<Vec<PersistedEnsemble>, PublishError> {
    let dir = work_dir.join(ENSEMBLES_DIR);
    let mut found: Vec<PersistedEnsemble> = list_dir(&dir)?
        .into_iter()
        .filter_map(|(name, path)| {
            let (seed, index_run) = parse_ensemble_file_name(&name)?;
            Some(PersistedEnsemble {
                seed,
                index_run,
                path,
            })
        })
        .collect();
    found.sort_by_key(|e| (e.seed, e.index_run));
    Ok(found)
}

/// List published prediction files in `output_dir`, ordered by dataset, index and split
pub fn list_predictions(output_dir: &Path) -> Result<Vec<PublishedPrediction>, PublishError> {
    let mut found: Vec<PublishedPrediction> = list_dir(output_dir)?
        .into_iter()
        .filter_map(|(name, path)| {
            let (dataset, split, index_run) = parse_prediction_file_name(&name)?;
            Some(PublishedPrediction {
                dataset,
                split,
                index_run,
                path,
            })
        })
        .collect();
    found.sort_by(|a, b| {
        (a.dataset.as_str(), a.index_run, a.split.as_str())
            .cmp(&(b.dataset.as_str(), b.index_run, b.split.as_str()))
    });
    Ok(found)
}

fn list_dir(dir: &Path) -> Result<Vec<(String, PathBuf)>, PublishError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PublishError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    Ok(entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberWeight, Metric};
    use ndarray::array;
    use tempfile::TempDir;

    fn model(task: TaskType) -> EnsembleModel {
        let a = ModelId::new(1, 2);
        let b = ModelId::new(1, 3);
        EnsembleModel {
            task,
            metric: Metric::Accuracy,
            ensemble_size: 4,
            candidates: vec![a, b],
            picks: vec![b, a, b, b],
            members: vec![
                MemberWeight { id: b, weight: 0.75 },
                MemberWeight { id: a, weight: 0.25 },
            ],
            trajectory: vec![0.8, 0.85, 0.9, 0.9],
            input_hash: "00".to_string(),
            fitted_at: 0,
        }
    }

    #[test]
    fn test_predict_weighted_sum() {
        let m = model(TaskType::MulticlassClassification);
        let arrays = vec![
            (ModelId::new(1, 2), array![[1.0, 0.0, 0.0]]),
            (ModelId::new(1, 3), array![[0.0, 1.0, 0.0]]),
        ];
        let combined = predict(Split::Valid, &m, &arrays).unwrap();
        assert_eq!(combined, array![[0.25, 0.75, 0.0]]);
    }

    #[test]
    fn test_predict_binary_keeps_positive_column() {
        let m = model(TaskType::BinaryClassification);
        let arrays = vec![
            (ModelId::new(1, 3), array![[0.2, 0.8], [0.6, 0.4]]),
            (ModelId::new(1, 2), array![[0.6, 0.4], [0.2, 0.8]]),
        ];
        let combined = predict(Split::Test, &m, &arrays).unwrap();
        assert_eq!(combined.dim(), (2, 1));
        assert!((combined[[0, 0]] - 0.7).abs() < 1e-12);
        assert!((combined[[1, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_predict_gated_on_member_count() {
        let m = model(TaskType::BinaryClassification);
        let one = vec![(ModelId::new(1, 3), array![[0.2, 0.8]])];
        assert!(predict(Split::Valid, &m, &one).is_none());

        let three = vec![
            (ModelId::new(1, 2), array![[0.2, 0.8]]),
            (ModelId::new(1, 3), array![[0.2, 0.8]]),
            (ModelId::new(1, 4), array![[0.2, 0.8]]),
        ];
        assert!(predict(Split::Valid, &m, &three).is_none());

        let stranger = vec![
            (ModelId::new(1, 2), array![[0.2, 0.8]]),
            (ModelId::new(1, 9), array![[0.2, 0.8]]),
        ];
        assert!(predict(Split::Valid, &m, &stranger).is_none());
    }

    #[test]
    fn test_write_predictions_text_format() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), &dir.path().join("out"), "iris", 1);

        let path = publisher
            .write_predictions(Split::Valid, 7, &array![[0.25], [1.0]])
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "iris_valid_007.predict");
        assert_eq!(fs::read_to_string(&path).unwrap(), "0.25\n1\n");
        assert!(!path.with_extension("predict.tmp").exists());
    }

    #[test]
    fn test_save_and_load_ensemble() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), dir.path(), "iris", 3);
        let m = model(TaskType::BinaryClassification);

        let path = publisher.save_ensemble(&m, 12).unwrap();
        assert_eq!(path.file_name().unwrap(), "3.0000000012.ensemble");
        assert_eq!(path, ensemble_file_path(dir.path(), 3, 12));
        assert_eq!(load_ensemble(&path).unwrap(), m);

        let listed = list_ensembles(dir.path()).unwrap();
        assert_eq!(
            listed,
            vec![PersistedEnsemble {
                seed: 3,
                index_run: 12,
                path
            }]
        );
    }

    #[test]
    fn test_parse_prediction_file_name() {
        assert_eq!(
            parse_prediction_file_name("my_data_test_012.predict"),
            Some(("my_data".to_string(), Split::Test, 12))
        );
        assert_eq!(parse_prediction_file_name("_test_1.predict"), None);
        assert_eq!(parse_prediction_file_name("data_train_1.predict"), None);
        assert_eq!(parse_ensemble_file_name("1.0000000002.ensemble"), Some((1, 2)));
        assert_eq!(parse_ensemble_file_name("1.ensemble"), None);
    }

    #[test]
    fn test_listing_missing_directories_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(list_ensembles(dir.path()).unwrap().is_empty());
        assert!(list_predictions(&dir.path().join("out")).unwrap().is_empty());
    }
}
