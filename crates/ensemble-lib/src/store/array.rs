//! Prediction array decoding and storage precision
//!
//! Training workers write NumPy `.npy` files, usually float64 or float32. Arrays are
//! normalized to two dimensions (`[n_samples, n_outputs]`) and kept at the configured
//! precision to trade accuracy for memory.

use crate::error::StoreError;
use half::f16;
use ndarray::{Array2, ArrayD, Axis, Ix1, Ix2};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Float width predictions are stored with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Half,
    #[default]
    Single,
    Double,
}

impl Precision {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            16 => Some(Precision::Half),
            32 => Some(Precision::Single),
            64 => Some(Precision::Double),
            _ => None,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Precision::Half => 16,
            Precision::Single => 32,
            Precision::Double => 64,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(Precision::from_bits)
            .ok_or_else(|| format!("unsupported precision '{}', expected 16, 32 or 64", s))
    }
}

/// A cached prediction matrix at its storage precision
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionArray {
    F16(Array2<f16>),
    F32(Array2<f32>),
    F64(Array2<f64>),
}

impl PredictionArray {
    /// Store a float64 matrix at the given precision
    pub fn from_f64(values: Array2<f64>, precision: Precision) -> Self {
        match precision {
            Precision::Half => PredictionArray::F16(values.mapv(f16::from_f64)),
            Precision::Single => PredictionArray::F32(values.mapv(|v| v as f32)),
            Precision::Double => PredictionArray::F64(values),
        }
    }

    /// Widen to float64 for scoring and combination
    pub fn to_f64(&self) -> Array2<f64> {
        match self {
            PredictionArray::F16(a) => a.mapv(|v| v.to_f64()),
            PredictionArray::F32(a) => a.mapv(f64::from),
            PredictionArray::F64(a) => a.clone(),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        match self {
            PredictionArray::F16(a) => a.dim(),
            PredictionArray::F32(a) => a.dim(),
            PredictionArray::F64(a) => a.dim(),
        }
    }

    /// Bytes held by the array's elements
    pub fn nbytes(&self) -> usize {
        let (rows, cols) = self.dim();
        let width = match self {
            PredictionArray::F16(_) => 2,
            PredictionArray::F32(_) => 4,
            PredictionArray::F64(_) => 8,
        };
        rows * cols * width
    }

    /// False if any value is NaN or infinite at storage precision
    pub fn all_finite(&self) -> bool {
        match self {
            PredictionArray::F16(a) => a.iter().all(|v| v.is_finite()),
            PredictionArray::F32(a) => a.iter().all(|v| v.is_finite()),
            PredictionArray::F64(a) => a.iter().all(|v| v.is_finite()),
        }
    }
}

/// Read a prediction file, reject non-finite values and cast to `precision`
pub fn read_prediction(path: &Path, precision: Precision) -> Result<PredictionArray, StoreError> {
    let values = read_matrix(path, false)?;
    let array = PredictionArray::from_f64(values, precision);
    if !array.all_finite() {
        return Err(StoreError::NonFinite {
            path: path.to_path_buf(),
        });
    }
    Ok(array)
}

/// Read a `.npy` file as a float64 matrix
///
/// Float64 and float32 payloads are accepted; with `allow_integers`, int64 and int32
/// label arrays too. Rank-1 arrays become a single column.
pub fn read_matrix(path: &Path, allow_integers: bool) -> Result<Array2<f64>, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let decoded = match ArrayD::<f64>::read_npy(bytes.as_slice()) {
        Ok(a) => Ok(a),
        Err(first) => ArrayD::<f32>::read_npy(bytes.as_slice())
            .map(|a| a.mapv(f64::from))
            .or_else(|_| {
                if allow_integers {
                    read_integer_npy(&bytes)
                } else {
                    Err(first)
                }
            }),
    };

    let array = decoded.map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        source: e,
    })?;

    to_matrix(array, path)
}

fn read_integer_npy(bytes: &[u8]) -> Result<ArrayD<f64>, ReadNpyError> {
    match ArrayD::<i64>::read_npy(bytes) {
        Ok(a) => Ok(a.mapv(|v| v as f64)),
        Err(_) => ArrayD::<i32>::read_npy(bytes).map(|a| a.mapv(f64::from)),
    }
}

fn to_matrix(array: ArrayD<f64>, path: &Path) -> Result<Array2<f64>, StoreError> {
    let unsupported = |ndim: usize| StoreError::UnsupportedShape {
        path: path.to_path_buf(),
        ndim,
    };

    match array.ndim() {
        1 => array
            .into_dimensionality::<Ix1>()
            .map(|a| a.insert_axis(Axis(1)))
            .map_err(|_| unsupported(1)),
        2 => array
            .into_dimensionality::<Ix2>()
            .map_err(|_| unsupported(2)),
        n => Err(unsupported(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, array};
    use ndarray_npy::write_npy;
    use tempfile::TempDir;

    #[test]
    fn test_precision_parsing() {
        assert_eq!("16".parse::<Precision>().unwrap(), Precision::Half);
        assert_eq!(Precision::from_bits(64), Some(Precision::Double));
        assert!("128".parse::<Precision>().is_err());
        assert_eq!(Precision::default().bits(), 32);
    }

    #[test]
    fn test_read_float32_and_rank1() {
        let dir = TempDir::new().unwrap();
        let f32_path = dir.path().join("a.npy");
        write_npy(&f32_path, &array![[0.25f32, 0.75], [0.5, 0.5]]).unwrap();
        let m = read_matrix(&f32_path, false).unwrap();
        assert_eq!(m, array![[0.25, 0.75], [0.5, 0.5]]);

        let rank1 = dir.path().join("b.npy");
        write_npy(&rank1, &arr1(&[1.0f64, 2.0, 3.0])).unwrap();
        let m = read_matrix(&rank1, false).unwrap();
        assert_eq!(m.dim(), (3, 1));
    }

    #[test]
    fn test_integer_labels_only_when_allowed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.npy");
        write_npy(&path, &arr1(&[0i64, 1, 1])).unwrap();

        assert!(matches!(read_matrix(&path, false), Err(StoreError::Decode { .. })));
        assert_eq!(read_matrix(&path, true).unwrap(), array![[0.0], [1.0], [1.0]]);
    }

    #[test]
    fn test_non_finite_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nan.npy");
        write_npy(&path, &array![[0.5, f64::NAN]]).unwrap();
        assert!(matches!(
            read_prediction(&path, Precision::Double),
            Err(StoreError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.npy");
        write_npy(&path, &array![[0.5, 0.5], [0.1, 0.9]]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        assert!(matches!(
            read_prediction(&path, Precision::Single),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_precision_storage_size() {
        let values = array![[0.1, 0.9], [0.3, 0.7]];
        let half = PredictionArray::from_f64(values.clone(), Precision::Half);
        let double = PredictionArray::from_f64(values.clone(), Precision::Double);
        assert_eq!(half.nbytes(), 8);
        assert_eq!(double.nbytes(), 32);
        assert_eq!(double.to_f64(), values);
        assert!((half.to_f64()[[0, 1]] - 0.9).abs() < 1e-3);
    }
}
