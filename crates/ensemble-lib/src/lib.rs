//! Ensemble builder library
//!
//! This crate provides the core functionality for:
//! - Tracking per-model prediction files written by training workers
//! - Scoring and ranking candidates against the ensemble-split targets
//! - Greedy forward ensemble selection
//! - Publishing weighted ensemble predictions
//! - The polling worker and its time/memory governor
//! - Health checks and observability

pub mod ensemble;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod scoring;
pub mod store;
pub mod worker;

pub use error::{ConfigError, FitError, PublishError, ScoreError, StoreError, TargetError};
pub use health::{
    BuilderPhase, Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{EnsembleMetrics, StructuredLogger};
