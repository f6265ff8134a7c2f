//! Ground truth for the ensemble split

use super::array::read_matrix;
use crate::error::TargetError;
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// File the training side writes the ensemble-split targets to
pub const TARGETS_FILE: &str = "true_targets_ensemble.npy";

/// Source of the ensemble-split targets
pub trait TargetSource: Send + Sync {
    /// Load the targets, failing with [`TargetError::NotFound`] until training wrote them
    fn load_ensemble_targets(&self) -> Result<Array2<f64>, TargetError>;
}

/// Reads the targets from `<work_dir>/true_targets_ensemble.npy`
#[derive(Debug, Clone)]
pub struct NpyTargetSource {
    path: PathBuf,
}

impl NpyTargetSource {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            path: work_dir.join(TARGETS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TargetSource for NpyTargetSource {
    fn load_ensemble_targets(&self) -> Result<Array2<f64>, TargetError> {
        if !self.path.is_file() {
            return Err(TargetError::NotFound(self.path.clone()));
        }
        Ok(read_matrix(&self.path, true)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, array};
    use ndarray_npy::write_npy;
    use tempfile::TempDir;

    #[test]
    fn test_missing_targets_not_found() {
        let dir = TempDir::new().unwrap();
        let source = NpyTargetSource::new(dir.path());
        assert!(matches!(
            source.load_ensemble_targets(),
            Err(TargetError::NotFound(_))
        ));
    }

    #[test]
    fn test_integer_labels_loaded_as_column() {
        let dir = TempDir::new().unwrap();
        write_npy(dir.path().join(TARGETS_FILE), &arr1(&[1i64, 0, 1])).unwrap();

        let targets = NpyTargetSource::new(dir.path())
            .load_ensemble_targets()
            .unwrap();
        assert_eq!(targets, array![[1.0], [0.0], [1.0]]);
    }
}
