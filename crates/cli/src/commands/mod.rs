//! CLI subcommands

pub mod candidates;
pub mod ensembles;
pub mod predictions;
