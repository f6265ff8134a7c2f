//! Prediction file discovery
//!
//! Training workers drop `prediction_<split>_<seed>_<run_id>.npy` files into one
//! directory per split. Files can appear (or vanish) at any time, so every lookup here
//! tolerates races with the writers.

use crate::error::StoreError;
use crate::models::{ModelId, PredictionArtifact, Split};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Which seeds a builder reads prediction files for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedFilter {
    /// Only files written by runs with this seed
    Only(u64),
    /// Any seed (shared pool mode)
    Any,
}

impl SeedFilter {
    pub fn matches(&self, seed: u64) -> bool {
        match self {
            SeedFilter::Only(s) => *s == seed,
            SeedFilter::Any => true,
        }
    }
}

/// Parse the model id out of a split's prediction file name
pub fn parse_file_name(split: Split, file_name: &str) -> Option<ModelId> {
    let prefix = format!("prediction_{}_", split.as_str());
    let stem = file_name.strip_prefix(&prefix)?.strip_suffix(".npy")?;
    let (seed, run_id) = stem.split_once('_')?;
    Some(ModelId::new(seed.parse().ok()?, run_id.parse().ok()?))
}

/// List the prediction files of one split directory, sorted by model id
///
/// Returns `Ok(None)` when the directory does not exist yet.
pub fn scan_split(
    dir: &Path,
    split: Split,
    filter: SeedFilter,
) -> Result<Option<Vec<PredictionArtifact>>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Io {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    };

    let mut artifacts = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(id) = parse_file_name(split, name) else {
            debug!(file = %name, "Skipping file that is not a prediction file");
            continue;
        };
        if !filter.matches(id.seed) {
            continue;
        }

        // The writer may have replaced or removed the file since read_dir
        match entry.metadata().and_then(|m| m.modified()) {
            Ok(last_modified) => artifacts.push(PredictionArtifact {
                id,
                split,
                path: entry.path(),
                last_modified,
            }),
            Err(e) => debug!(file = %name, error = %e, "Prediction file vanished during scan"),
        }
    }

    artifacts.sort_by_key(|a| a.id);
    Ok(Some(artifacts))
}

/// Locate one candidate's prediction file for a split
pub fn find_artifact(work_dir: &Path, split: Split, id: ModelId) -> Option<PredictionArtifact> {
    let path = work_dir.join(split.dir_name()).join(split.file_name(id));
    let last_modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
    Some(PredictionArtifact {
        id,
        split,
        path,
        last_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name(Split::Ensemble, "prediction_ensemble_1_23.npy"),
            Some(ModelId::new(1, 23))
        );
        assert_eq!(parse_file_name(Split::Valid, "prediction_ensemble_1_23.npy"), None);
        assert_eq!(parse_file_name(Split::Test, "prediction_test_1_23.npy.tmp"), None);
        assert_eq!(parse_file_name(Split::Test, "prediction_test_x_23.npy"), None);
        assert_eq!(parse_file_name(Split::Test, "prediction_test_123.npy"), None);
    }

    #[test]
    fn test_seed_filter() {
        assert!(SeedFilter::Any.matches(7));
        assert!(SeedFilter::Only(1).matches(1));
        assert!(!SeedFilter::Only(1).matches(2));
    }

    #[test]
    fn test_scan_missing_directory() {
        let dir = TempDir::new().unwrap();
        let result = scan_split(&dir.path().join("nope"), Split::Ensemble, SeedFilter::Any);
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let dir = TempDir::new().unwrap();
        for name in [
            "prediction_ensemble_1_10.npy",
            "prediction_ensemble_1_2.npy",
            "prediction_ensemble_2_1.npy",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let all = scan_split(dir.path(), Split::Ensemble, SeedFilter::Any)
            .unwrap()
            .unwrap();
        let ids: Vec<ModelId> = all.iter().map(|a| a.id).collect();
        assert_eq!(
            ids,
            vec![ModelId::new(1, 2), ModelId::new(1, 10), ModelId::new(2, 1)]
        );

        let seed_one = scan_split(dir.path(), Split::Ensemble, SeedFilter::Only(1))
            .unwrap()
            .unwrap();
        assert_eq!(seed_one.len(), 2);
    }
}
