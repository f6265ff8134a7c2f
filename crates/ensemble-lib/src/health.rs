//! Builder health
//!
//! Keeps one snapshot of what the builder is doing: its lifecycle phase, the latest
//! store statistics, how many ensembles it published, and the status of each of its
//! components. The daemon serves the snapshot on `/healthz` and derives `/readyz`
//! from the phase.

use crate::store::StoreStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component status, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operational, e.g. waiting for training output
    Degraded,
    Unhealthy,
}

/// Parts of the builder that report their own status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Degraded while targets or predictions are missing
    Store,
    Fitter,
    Publisher,
    /// Unhealthy once memory could not be brought under the limit
    Governor,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Store,
        Component::Fitter,
        Component::Publisher,
        Component::Governor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Store => "store",
            Component::Fitter => "fitter",
            Component::Publisher => "publisher",
            Component::Governor => "governor",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: Component,
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last status change
    pub updated_at: i64,
}

impl ComponentHealth {
    fn new(component: Component, status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            component,
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Lifecycle of the builder as driven by the resource governor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuilderPhase {
    /// Configured, no worker started yet
    Starting,
    /// A worker is polling with this candidate cap
    Running { n_best: usize, restarts: u32 },
    /// The governor returned; `failed` when it gave up rather than finished
    Stopped { reason: String, failed: bool },
}

/// Snapshot served on `/healthz`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst component status
    pub status: ComponentStatus,
    pub phase: BuilderPhase,
    /// Store statistics as of the last poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreStats>,
    /// Ensembles published so far
    pub published: u64,
    pub components: Vec<ComponentHealth>,
}

impl HealthResponse {
    pub fn component(&self, component: Component) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == component)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct BuilderState {
    phase: BuilderPhase,
    store: Option<StoreStats>,
    published: u64,
    components: Vec<ComponentHealth>,
}

/// Shared, cloneable handle on the builder's health snapshot
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<BuilderState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// All components start healthy, the builder in [`BuilderPhase::Starting`]
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| ComponentHealth::new(*c, ComponentStatus::Healthy, None))
            .collect();
        Self {
            state: Arc::new(RwLock::new(BuilderState {
                phase: BuilderPhase::Starting,
                store: None,
                published: 0,
                components,
            })),
        }
    }

    async fn set_status(
        &self,
        component: Component,
        status: ComponentStatus,
        message: Option<String>,
    ) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.components.iter_mut().find(|c| c.component == component) {
            *entry = ComponentHealth::new(component, status, message);
        }
    }

    pub async fn set_healthy(&self, component: Component) {
        self.set_status(component, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, component: Component, message: impl Into<String>) {
        self.set_status(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.set_status(component, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    pub async fn status(&self, component: Component) -> ComponentStatus {
        self.state
            .read()
            .await
            .components
            .iter()
            .find(|c| c.component == component)
            .map(|c| c.status)
            .unwrap_or(ComponentStatus::Healthy)
    }

    pub async fn set_phase(&self, phase: BuilderPhase) {
        self.state.write().await.phase = phase;
    }

    pub async fn record_store(&self, stats: StoreStats) {
        self.state.write().await.store = Some(stats);
    }

    pub async fn record_published(&self, published: u64) {
        self.state.write().await.published = published;
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            phase: state.phase.clone(),
            store: state.store.clone(),
            published: state.published,
            components: state.components.clone(),
        }
    }

    /// Ready while a worker runs and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let health = self.health().await;
        let reason = match &health.phase {
            BuilderPhase::Starting => Some("Builder not yet initialized".to_string()),
            BuilderPhase::Stopped { reason, .. } => Some(format!("Builder stopped: {}", reason)),
            BuilderPhase::Running { .. } if health.status == ComponentStatus::Unhealthy => {
                health
                    .components
                    .iter()
                    .find(|c| c.status == ComponentStatus::Unhealthy)
                    .map(|c| format!("{} unhealthy", c.component))
            }
            BuilderPhase::Running { .. } => None,
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
