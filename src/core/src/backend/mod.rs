//! The backend port and its three adapters.
//!
//! Every storage engine implements [`BackendPort`]. The set of engines is
//! closed, so the selector hands out a [`Backend`] enum rather than a trait
//! object and dispatch never depends on runtime type inspection.

mod context;
pub mod embedded;
pub mod generic;
mod plan;
pub mod postgres;
pub mod server;
pub mod sql;
mod sqlite_functions;

use std::fmt::{self, Display};
use std::str::FromStr;

use async_trait::async_trait;
use common_exception::{FilterError, Result};
pub use context::ExecutionContext;
pub use embedded::{EmbeddedAdapter, EmbeddedLocks};
pub use generic::GenericAdapter;
pub use plan::{
    Artifact, FeatureSet, FilterPlan, Materialization, PlannedStep, ResolvedSpatial, fingerprint,
};
pub use server::{ServerAdapter, ServerClient, ViewName, ViewNamer};

use crate::layer::LayerRef;
use crate::request::FilterResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Server,
    Embedded,
    Generic,
}

impl BackendKind {
    /// Fallback order used by the capability probe.
    pub const RANKING: [BackendKind; 3] =
        [BackendKind::Server, BackendKind::Embedded, BackendKind::Generic];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Server => "server",
            BackendKind::Embedded => "embedded",
            BackendKind::Generic => "generic",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" | "postgres" | "postgresql" | "postgis" => Ok(BackendKind::Server),
            "embedded" | "sqlite" | "spatialite" => Ok(BackendKind::Embedded),
            "generic" | "ogr" | "memory" => Ok(BackendKind::Generic),
            other => Err(FilterError::Internal(format!("unknown backend '{other}'"))),
        }
    }
}

/// Static per-kind description of what a backend can do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendCapabilities {
    pub supports_materialized_views: bool,
    pub supports_native_spatial_index: bool,
    pub supports_concurrent_queries: bool,
    /// Can filter within a previous materialization instead of re-running
    /// the whole history.
    pub supports_incremental_composition: bool,
    pub recommended_max_features: Option<u64>,
    /// Rough cost used for performance advisories.
    pub micros_per_feature: u64,
}

impl BackendCapabilities {
    pub const fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Server => Self {
                supports_materialized_views: true,
                supports_native_spatial_index: true,
                supports_concurrent_queries: true,
                supports_incremental_composition: true,
                recommended_max_features: None,
                micros_per_feature: 2,
            },
            BackendKind::Embedded => Self {
                supports_materialized_views: false,
                supports_native_spatial_index: true,
                supports_concurrent_queries: false,
                supports_incremental_composition: true,
                recommended_max_features: Some(500_000),
                micros_per_feature: 50,
            },
            BackendKind::Generic => Self {
                supports_materialized_views: false,
                supports_native_spatial_index: false,
                supports_concurrent_queries: true,
                supports_incremental_composition: true,
                recommended_max_features: Some(100_000),
                micros_per_feature: 500,
            },
        }
    }

    pub fn exceeds_recommended(&self, feature_count: u64) -> bool {
        self.recommended_max_features
            .is_some_and(|max| feature_count > max)
    }

    pub fn estimated_seconds(&self, feature_count: u64) -> u64 {
        feature_count.saturating_mul(self.micros_per_feature) / 1_000_000
    }
}

/// The uniform contract every storage engine implements.
#[async_trait]
pub trait BackendPort: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::for_kind(self.kind())
    }

    /// Executes a plan whose newest step carries a spatial predicate.
    async fn apply_geometric_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult>;

    /// Executes a plan whose newest step is attribute-only.
    async fn apply_attribute_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult>;

    /// Drops the artifact behind a materialization the cache let go of.
    async fn discard(&self, materialization: &Materialization) -> Result<()>;

    /// Releases connections and remaining artifacts. Idempotent.
    async fn release(&self) -> Result<()>;
}

pub(crate) fn require_spatial(plan: &FilterPlan) -> Result<()> {
    match plan.last_step() {
        Some(step) if step.is_spatial() => Ok(()),
        _ => Err(FilterError::Internal(
            "geometric filter requested without a spatial predicate".to_owned(),
        )),
    }
}

pub(crate) fn require_attribute_only(plan: &FilterPlan) -> Result<()> {
    match plan.last_step() {
        Some(step) if !step.is_spatial() && step.attribute.is_some() => Ok(()),
        _ => Err(FilterError::Internal(
            "attribute filter requested for a step without an attribute-only expression"
                .to_owned(),
        )),
    }
}

/// The backend bound to a layer.
pub enum Backend {
    Server(ServerAdapter),
    Embedded(EmbeddedAdapter),
    Generic(GenericAdapter),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            Backend::Server($adapter) => $body,
            Backend::Embedded($adapter) => $body,
            Backend::Generic($adapter) => $body,
        }
    };
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("layer", &self.layer().id)
            .finish()
    }
}

impl Backend {
    /// The layer this backend is bound to.
    pub fn layer(&self) -> &LayerRef {
        dispatch!(self, adapter => adapter.layer())
    }

    /// Routes a plan to the geometric or attribute entry point.
    pub async fn execute(&self, plan: &FilterPlan, ctx: &ExecutionContext) -> Result<FilterResult> {
        let spatial = plan.last_step().is_some_and(PlannedStep::is_spatial);
        if spatial {
            self.apply_geometric_filter(plan, ctx).await
        } else {
            self.apply_attribute_filter(plan, ctx).await
        }
    }
}

#[async_trait]
impl BackendPort for Backend {
    fn kind(&self) -> BackendKind {
        dispatch!(self, adapter => adapter.kind())
    }

    async fn apply_geometric_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        dispatch!(self, adapter => adapter.apply_geometric_filter(plan, ctx).await)
    }

    async fn apply_attribute_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        dispatch!(self, adapter => adapter.apply_attribute_filter(plan, ctx).await)
    }

    async fn discard(&self, materialization: &Materialization) -> Result<()> {
        dispatch!(self, adapter => adapter.discard(materialization).await)
    }

    async fn release(&self) -> Result<()> {
        dispatch!(self, adapter => adapter.release().await)
    }
}

/// Formats a feature count the way advisories show it (`120k`).
pub(crate) fn short_count(count: u64) -> String {
    if count >= 1_000 {
        format!("{}k", count / 1_000)
    } else {
        count.to_string()
    }
}
