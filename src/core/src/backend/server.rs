//! Server engine adapter: each plan becomes a materialized view with a
//! spatial index, and the layer's subset selects the keys stored in it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::plan::{Artifact, FilterPlan, Materialization};
use super::sql::{SelectSpec, SourceTable, qualified, view_subset};
use super::{
    BackendKind, BackendPort, ExecutionContext, require_attribute_only, require_spatial,
};
use crate::cache::CacheKey;
use crate::events::Phase;
use crate::layer::LayerRef;
use crate::request::FilterResult;

/// A server-side relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewName {
    pub schema: Option<String>,
    pub name: String,
}

impl ViewName {
    pub fn qualified(&self) -> String {
        qualified(self.schema.as_deref(), &self.name)
    }
}

/// Hands out view names that no other engine session can produce.
///
/// Names carry a random per-session token and a build sequence number, so
/// two sessions running the same plan on the same server never share a
/// view, and a rebuilt plan never collides with a view still awaiting its
/// drop.
#[derive(Debug)]
pub struct ViewNamer {
    session: String,
    next: AtomicU64,
}

impl ViewNamer {
    pub fn new() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self::with_session(&token[..12])
    }

    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Prefix shared by every view of this session.
    pub fn prefix(&self) -> String {
        format!("lf_mv_{}_", self.session)
    }

    pub fn next_name(&self, fingerprint: &str) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{seq}_{fingerprint}", self.prefix())
    }
}

impl Default for ViewNamer {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured statements the server adapter issues.
///
/// [`super::postgres::PgPool`] renders them as PostGIS SQL.
#[async_trait]
pub trait ServerClient: Send + Sync {
    /// Succeeds when the server answers a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Creates the view with a spatial index on its geometry. Fails when a
    /// relation of that name already exists.
    async fn create_materialized_view(&self, view: &ViewName, select: &SelectSpec) -> Result<()>;

    async fn count_rows(&self, view: &ViewName) -> Result<u64>;

    async fn drop_materialized_view(&self, view: &ViewName) -> Result<()>;
}

pub struct ServerAdapter {
    layer: LayerRef,
    client: Arc<dyn ServerClient>,
    namer: Arc<ViewNamer>,
    views: Mutex<Vec<ViewName>>,
}

impl ServerAdapter {
    pub fn new(layer: LayerRef, client: Arc<dyn ServerClient>, namer: Arc<ViewNamer>) -> Self {
        Self {
            layer,
            client,
            namer,
            views: Mutex::new(Vec::new()),
        }
    }

    pub fn layer(&self) -> &LayerRef {
        &self.layer
    }

    async fn run(&self, plan: &FilterPlan, ctx: &ExecutionContext) -> Result<FilterResult> {
        let started = Instant::now();
        ctx.checkpoint(Phase::BuildMaterialization)?;
        let select = SelectSpec::from_plan(plan, SourceTable::from_source(&self.layer.source));
        let key = CacheKey::new(
            self.layer.id.clone(),
            BackendKind::Server,
            plan.fingerprint.clone(),
        );
        let client = Arc::clone(&self.client);
        let fingerprint = plan.fingerprint.clone();
        let primary_key = self.layer.source.primary_key.clone();
        let (schema, _) = self.layer.source.schema_and_table();
        let schema = schema.map(ToOwned::to_owned);
        let namer = Arc::clone(&self.namer);
        let materialization = ctx
            .materialize(key, move || async move {
                let build_view = ViewName {
                    schema,
                    name: namer.next_name(&fingerprint),
                };
                client
                    .create_materialized_view(&build_view, &select)
                    .await?;
                debug!(view = %build_view.qualified(), "created materialized view");
                Ok(Materialization {
                    fingerprint,
                    subset: view_subset(
                        &primary_key,
                        build_view.schema.as_deref(),
                        &build_view.name,
                    ),
                    feature_count: None,
                    artifact: Artifact::View {
                        schema: build_view.schema,
                        name: build_view.name,
                    },
                })
            })
            .await?;
        let Artifact::View { schema, name } = &materialization.artifact else {
            return Err(FilterError::Internal(
                "server materialization without a view".to_owned(),
            ));
        };
        let view = ViewName {
            schema: schema.clone(),
            name: name.clone(),
        };
        {
            let mut views = self.views.lock();
            if !views.contains(&view) {
                views.push(view.clone());
            }
        }

        ctx.checkpoint(Phase::RunPredicate)?;
        ctx.checkpoint(Phase::ComputeCount)?;
        let count = self.client.count_rows(&view).await?;
        Ok(FilterResult::from_materialization(
            BackendKind::Server,
            materialization,
            Some(count),
            started.elapsed(),
        ))
    }
}

#[async_trait]
impl BackendPort for ServerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Server
    }

    async fn apply_geometric_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        require_spatial(plan)?;
        self.run(plan, ctx).await
    }

    async fn apply_attribute_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        require_attribute_only(plan)?;
        self.run(plan, ctx).await
    }

    async fn discard(&self, materialization: &Materialization) -> Result<()> {
        let Artifact::View { schema, name } = &materialization.artifact else {
            return Ok(());
        };
        let view = ViewName {
            schema: schema.clone(),
            name: name.clone(),
        };
        self.client.drop_materialized_view(&view).await?;
        self.views.lock().retain(|known| known != &view);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let views = std::mem::take(&mut *self.views.lock());
        for view in views {
            if let Err(e) = self.client.drop_materialized_view(&view).await {
                warn!(layer = %self.layer.id, view = %view.qualified(), error = %e, "failed to drop view");
            }
        }
        Ok(())
    }
}
