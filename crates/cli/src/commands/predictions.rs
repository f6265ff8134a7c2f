//! Published prediction listing

use anyhow::{Context, Result};
use ensemble_lib::ensemble;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tabled::Tabled;

use crate::output::{print_json, print_table, print_title, OutputFormat};

/// One published prediction file
#[derive(Debug, Serialize)]
struct PredictionInfo {
    dataset: String,
    split: String,
    index: u64,
    rows: usize,
    columns: usize,
    path: String,
}

/// Row for predictions table
#[derive(Tabled)]
struct PredictionRow {
    #[tabled(rename = "Dataset")]
    dataset: String,
    #[tabled(rename = "Split")]
    split: String,
    #[tabled(rename = "Index")]
    index: String,
    #[tabled(rename = "Rows")]
    rows: usize,
    #[tabled(rename = "Cols")]
    columns: usize,
}

/// Count rows and columns of a whitespace-separated prediction file
fn matrix_dims(text: &str) -> (usize, usize) {
    let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let columns = rows.first().map(|l| l.split_whitespace().count()).unwrap_or(0);
    (rows.len(), columns)
}

/// List published predictions, optionally for one dataset only
pub fn list_predictions(
    output_dir: &Path,
    dataset: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let published = ensemble::list_predictions(output_dir)
        .with_context(|| format!("Failed to list predictions in {}", output_dir.display()))?;

    let mut infos = Vec::with_capacity(published.len());
    for p in published {
        if dataset.is_some_and(|d| d != p.dataset) {
            continue;
        }
        let text = fs::read_to_string(&p.path)
            .with_context(|| format!("Failed to read {}", p.path.display()))?;
        let (rows, columns) = matrix_dims(&text);
        infos.push(PredictionInfo {
            dataset: p.dataset,
            split: p.split.as_str().to_string(),
            index: p.index_run,
            rows,
            columns,
            path: p.path.display().to_string(),
        });
    }

    match format {
        OutputFormat::Json => print_json(&infos)?,
        OutputFormat::Table => {
            print_title("Published Predictions");
            println!("Output dir: {}", output_dir.display());
            println!();
            let rows: Vec<PredictionRow> = infos
                .iter()
                .map(|i| PredictionRow {
                    dataset: i.dataset.clone(),
                    split: i.split.clone(),
                    index: format!("{:03}", i.index),
                    rows: i.rows,
                    columns: i.columns,
                })
                .collect();
            print_table(rows, "No predictions found");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_dims() {
        assert_eq!(matrix_dims("0.1 0.9\n0.4 0.6\n0.5 0.5\n"), (3, 2));
        assert_eq!(matrix_dims("0.5\n\n0.7\n"), (2, 1));
        assert_eq!(matrix_dims(""), (0, 0));
    }
}
