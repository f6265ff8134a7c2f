//! Candidate listing

use anyhow::{Context, Result};
use ensemble_lib::store::{find_artifact, read_matrix, scan_split, SeedFilter};
use ensemble_lib::Split;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    color_presence, format_bytes, format_mtime, print_info, print_json, print_table,
    print_title, print_warning, unix_secs, OutputFormat,
};

/// One candidate as shown in JSON output
#[derive(Debug, Serialize)]
struct CandidateInfo {
    seed: u64,
    run_id: u64,
    modified: i64,
    size_bytes: u64,
    valid: bool,
    test: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<(usize, usize)>,
}

/// Row for candidates table
#[derive(Tabled)]
struct CandidateRow {
    #[tabled(rename = "Seed")]
    seed: u64,
    #[tabled(rename = "Run")]
    run_id: u64,
    #[tabled(rename = "Modified")]
    modified: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Valid")]
    valid: String,
    #[tabled(rename = "Test")]
    test: String,
    #[tabled(rename = "Shape")]
    shape: String,
}

/// List the candidates with an ensemble-split prediction file
pub fn list_candidates(
    work_dir: &Path,
    seed: Option<u64>,
    shapes: bool,
    format: OutputFormat,
) -> Result<()> {
    let filter = seed.map(SeedFilter::Only).unwrap_or(SeedFilter::Any);
    let dir = work_dir.join(Split::Ensemble.dir_name());
    let artifacts = scan_split(&dir, Split::Ensemble, filter)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let Some(artifacts) = artifacts else {
        if let OutputFormat::Json = format {
            return print_json::<[CandidateInfo]>(&[]);
        }
        print_warning(&format!(
            "No ensemble predictions yet: {} does not exist",
            dir.display()
        ));
        return Ok(());
    };

    let mut candidates = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        // Files can vanish between the scan and here while training is running
        let size_bytes = fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0);
        let shape = if shapes {
            read_matrix(&artifact.path, false).ok().map(|m| m.dim())
        } else {
            None
        };
        candidates.push(CandidateInfo {
            seed: artifact.id.seed,
            run_id: artifact.id.run_id,
            modified: unix_secs(artifact.last_modified),
            size_bytes,
            valid: find_artifact(work_dir, Split::Valid, artifact.id).is_some(),
            test: find_artifact(work_dir, Split::Test, artifact.id).is_some(),
            shape,
        });
    }

    match format {
        OutputFormat::Json => print_json(&candidates)?,
        OutputFormat::Table => {
            print_title("Candidates");
            println!("Work dir: {}", work_dir.display());
            println!();

            let with_companions = candidates.iter().filter(|c| c.valid && c.test).count();
            let rows: Vec<CandidateRow> = artifacts
                .iter()
                .zip(&candidates)
                .map(|(artifact, c)| CandidateRow {
                    seed: c.seed,
                    run_id: c.run_id,
                    modified: format_mtime(artifact.last_modified),
                    size: format_bytes(c.size_bytes),
                    valid: color_presence(c.valid),
                    test: color_presence(c.test),
                    shape: match (shapes, c.shape) {
                        (false, _) => "-".to_string(),
                        (true, Some((rows, cols))) => format!("{}x{}", rows, cols),
                        (true, None) => "unreadable".to_string(),
                    },
                })
                .collect();
            print_table(rows, "No candidates found");

            if !candidates.is_empty() {
                println!();
                print_info(&format!(
                    "{} candidates, {} with valid and test predictions",
                    candidates.len(),
                    with_companions
                ));
            }
        }
    }

    Ok(())
}
