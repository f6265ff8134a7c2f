//! Ensemble builder CLI
//!
//! A command-line tool for inspecting the prediction files training workers leave in
//! the work directory and the ensembles and predictions the builder publishes.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{candidates, ensembles, predictions};
use std::path::PathBuf;

/// Ensemble builder CLI
#[derive(Parser)]
#[command(name = "ensb")]
#[command(author, version, about = "CLI for the Ensemble Builder", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List candidate models found in the work directory
    Candidates {
        /// Training work directory
        #[arg(long, env = "ENSEMBLE_WORK_DIR", default_value = ".")]
        work_dir: PathBuf,

        /// Only show candidates trained with this seed
        #[arg(long)]
        seed: Option<u64>,

        /// Read each ensemble-split file and report its shape
        #[arg(long)]
        shapes: bool,
    },

    /// Inspect persisted ensembles
    #[command(subcommand)]
    Ensembles(EnsembleCommands),

    /// List published ensemble predictions
    Predictions {
        /// Directory the builder writes predictions to
        #[arg(long, env = "ENSEMBLE_OUTPUT_DIR", default_value = "./output")]
        output_dir: PathBuf,

        /// Only show predictions for this dataset
        #[arg(long)]
        dataset: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum EnsembleCommands {
    /// List all persisted ensembles
    List {
        #[arg(long, env = "ENSEMBLE_WORK_DIR", default_value = ".")]
        work_dir: PathBuf,
    },

    /// Show the members and weights of one ensemble
    Show {
        #[arg(long, env = "ENSEMBLE_WORK_DIR", default_value = ".")]
        work_dir: PathBuf,

        /// Builder seed the ensemble was persisted under
        #[arg(long)]
        seed: u64,

        /// Publish index of the ensemble; defaults to the latest one
        #[arg(long)]
        index: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Candidates {
            work_dir,
            seed,
            shapes,
        } => {
            candidates::list_candidates(&work_dir, seed, shapes, cli.format)?;
        }
        Commands::Ensembles(cmd) => match cmd {
            EnsembleCommands::List { work_dir } => {
                ensembles::list_ensembles(&work_dir, cli.format)?;
            }
            EnsembleCommands::Show {
                work_dir,
                seed,
                index,
            } => {
                ensembles::show_ensemble(&work_dir, seed, index, cli.format)?;
            }
        },
        Commands::Predictions {
            output_dir,
            dataset,
        } => {
            predictions::list_predictions(&output_dir, dataset.as_deref(), cli.format)?;
        }
    }

    Ok(())
}
