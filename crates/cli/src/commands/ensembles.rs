//! Persisted ensemble commands

use anyhow::{bail, Context, Result};
use colored::Colorize;
use ensemble_lib::ensemble::{self, ensemble_file_path, load_ensemble};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    color_weight, eprint_warning, format_score, format_unix, print_json, print_table,
    print_title, OutputFormat,
};

/// Summary of one persisted ensemble
#[derive(Debug, Serialize)]
struct EnsembleSummary {
    seed: u64,
    index: u64,
    task: String,
    metric: String,
    members: usize,
    ensemble_size: usize,
    score: Option<f64>,
    fitted_at: i64,
    path: String,
}

/// Row for ensembles table
#[derive(Tabled)]
struct EnsembleRow {
    #[tabled(rename = "Seed")]
    seed: u64,
    #[tabled(rename = "Index")]
    index: u64,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Members")]
    members: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Fitted")]
    fitted_at: String,
}

/// Row for the members of one ensemble
#[derive(Tabled)]
struct MemberRow {
    #[tabled(rename = "Seed")]
    seed: u64,
    #[tabled(rename = "Run")]
    run_id: u64,
    #[tabled(rename = "Picks")]
    picks: usize,
    #[tabled(rename = "Weight")]
    weight: String,
}

/// List every ensemble persisted under the work directory
pub fn list_ensembles(work_dir: &Path, format: OutputFormat) -> Result<()> {
    let persisted = ensemble::list_ensembles(work_dir)
        .with_context(|| format!("Failed to list ensembles in {}", work_dir.display()))?;

    let mut summaries = Vec::with_capacity(persisted.len());
    for entry in &persisted {
        match load_ensemble(&entry.path) {
            Ok(model) => summaries.push(EnsembleSummary {
                seed: entry.seed,
                index: entry.index_run,
                task: model.task.to_string(),
                metric: model.metric.to_string(),
                members: model.member_count(),
                ensemble_size: model.ensemble_size,
                score: model.final_score(),
                fitted_at: model.fitted_at,
                path: entry.path.display().to_string(),
            }),
            Err(e) => eprint_warning(&format!("Skipping {}: {}", entry.path.display(), e)),
        }
    }

    match format {
        OutputFormat::Json => print_json(&summaries)?,
        OutputFormat::Table => {
            print_title("Ensembles");
            let rows: Vec<EnsembleRow> = summaries
                .iter()
                .map(|s| EnsembleRow {
                    seed: s.seed,
                    index: s.index,
                    task: s.task.clone(),
                    metric: s.metric.clone(),
                    members: format!("{}/{}", s.members, s.ensemble_size),
                    score: format_score(s.score),
                    fitted_at: format_unix(s.fitted_at),
                })
                .collect();
            print_table(rows, "No ensembles found");
        }
    }

    Ok(())
}

/// Show one ensemble; without an index the latest one for the seed is shown
pub fn show_ensemble(
    work_dir: &Path,
    seed: u64,
    index: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let index = match index {
        Some(index) => index,
        None => {
            let latest = ensemble::list_ensembles(work_dir)
                .with_context(|| format!("Failed to list ensembles in {}", work_dir.display()))?
                .into_iter()
                .filter(|e| e.seed == seed)
                .map(|e| e.index_run)
                .max();
            match latest {
                Some(index) => index,
                None => bail!("no ensembles persisted for seed {}", seed),
            }
        }
    };

    let path = ensemble_file_path(work_dir, seed, index);
    let model = load_ensemble(&path)
        .with_context(|| format!("Failed to load ensemble {}", path.display()))?;

    match format {
        OutputFormat::Json => print_json(&model)?,
        OutputFormat::Table => {
            print_title(&format!("Ensemble {}.{:010}", seed, index));
            println!("Task:       {}", model.task.to_string().cyan());
            println!("Metric:     {}", model.metric.to_string().cyan());
            println!("Size:       {}", model.ensemble_size);
            println!("Candidates: {}", model.candidates.len());
            println!("Score:      {}", format_score(model.final_score()));
            println!("Fitted:     {}", format_unix(model.fitted_at));
            println!("Input hash: {}", model.input_hash.dimmed());
            println!();

            let rows: Vec<MemberRow> = model
                .members
                .iter()
                .map(|m| MemberRow {
                    seed: m.id.seed,
                    run_id: m.id.run_id,
                    picks: model.picks.iter().filter(|p| **p == m.id).count(),
                    weight: color_weight(m.weight),
                })
                .collect();
            print_table(rows, "Ensemble has no members");
        }
    }

    Ok(())
}
