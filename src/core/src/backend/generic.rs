//! Generic I/O engine: features are read through the host and filtered in
//! process. No native index is assumed; an R-tree is built lazily once a
//! collection is larger than the configured threshold.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use layerfilter_spatial::{PreparedReference, SpatialRelation, buffer_geometry};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::plan::{Artifact, FeatureSet, FilterPlan, Materialization, PlannedStep};
use super::sql::id_subset;
use super::{
    BackendKind, BackendPort, ExecutionContext, require_attribute_only, require_spatial,
};
use crate::cache::CacheKey;
use crate::events::Phase;
use crate::host::{FeatureScope, HostLayers};
use crate::layer::{Feature, LayerRef};
use crate::request::FilterResult;

const CANCEL_CHECK_INTERVAL: usize = 1024;

pub struct GenericAdapter {
    layer: LayerRef,
    host: Arc<dyn HostLayers>,
    index_threshold: usize,
    source: Mutex<Option<Arc<FeatureSet>>>,
}

impl GenericAdapter {
    pub fn new(layer: LayerRef, host: Arc<dyn HostLayers>, index_threshold: usize) -> Self {
        Self {
            layer,
            host,
            index_threshold,
            source: Mutex::new(None),
        }
    }

    pub fn layer(&self) -> &LayerRef {
        &self.layer
    }

    /// The layer's full dataset, read once per adapter.
    async fn source(&self) -> Result<Arc<FeatureSet>> {
        if let Some(set) = self.source.lock().clone() {
            return Ok(set);
        }
        let features = self
            .host
            .fetch_features(&self.layer.id, FeatureScope::All)
            .await?;
        debug!(layer = %self.layer.id, features = features.len(), "loaded generic feature set");
        let set = Arc::new(FeatureSet::from_features(features));
        *self.source.lock() = Some(Arc::clone(&set));
        Ok(set)
    }

    async fn run(&self, plan: &FilterPlan, ctx: &ExecutionContext) -> Result<FilterResult> {
        let started = Instant::now();
        ctx.checkpoint(Phase::BuildMaterialization)?;
        let candidates = match &plan.base {
            Some(Materialization {
                artifact: Artifact::Features(set),
                ..
            }) => Arc::clone(set),
            Some(other) => {
                return Err(FilterError::Internal(format!(
                    "generic engine cannot compose with {}",
                    other.artifact.name()
                )));
            }
            None => self.source().await?,
        };

        ctx.checkpoint(Phase::RunPredicate)?;
        let key = CacheKey::new(
            self.layer.id.clone(),
            BackendKind::Generic,
            plan.fingerprint.clone(),
        );
        let steps = plan.steps.clone();
        let fingerprint = plan.fingerprint.clone();
        let primary_key = self.layer.source.primary_key.clone();
        let threshold = self.index_threshold;
        let cancel = ctx.cancel_token().clone();
        let materialization = ctx
            .materialize(key, move || async move {
                let set = tokio::task::spawn_blocking(move || {
                    evaluate_plan(&candidates, &steps, threshold, &cancel)
                })
                .await
                .map_err(|e| FilterError::Internal(format!("generic filter worker failed: {e}")))??;
                Ok(Materialization {
                    fingerprint,
                    subset: id_subset(&primary_key, &set.ids()),
                    feature_count: Some(set.len() as u64),
                    artifact: Artifact::Features(Arc::new(set)),
                })
            })
            .await?;

        ctx.checkpoint(Phase::ComputeCount)?;
        Ok(FilterResult::from_materialization(
            BackendKind::Generic,
            materialization,
            None,
            started.elapsed(),
        ))
    }
}

#[async_trait]
impl BackendPort for GenericAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
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

    async fn discard(&self, _materialization: &Materialization) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.source.lock().take();
        Ok(())
    }
}

/// Applies every step in order, each one filtering the previous result.
pub fn evaluate_plan(
    candidates: &FeatureSet,
    steps: &[PlannedStep],
    index_threshold: usize,
    cancel: &CancellationToken,
) -> Result<FeatureSet> {
    let mut current: Option<FeatureSet> = None;
    for step in steps {
        let input = current.as_ref().unwrap_or(candidates);
        current = Some(evaluate_step(input, step, index_threshold, cancel)?);
    }
    Ok(current.unwrap_or_else(|| FeatureSet::new(candidates.features().to_vec())))
}

fn evaluate_step(
    input: &FeatureSet,
    step: &PlannedStep,
    index_threshold: usize,
    cancel: &CancellationToken,
) -> Result<FeatureSet> {
    let spatial = step.spatial.as_ref().map(|spatial| {
        let references: Vec<PreparedReference> = spatial
            .references
            .iter()
            .map(|reference| match spatial.effective_buffer() {
                Some(distance) => PreparedReference::new(buffer_geometry(reference, distance)),
                None => PreparedReference::new(reference.clone()),
            })
            .collect();
        (spatial.predicate, references)
    });

    let positions = candidate_positions(input, spatial.as_ref(), index_threshold);
    let mut kept = Vec::new();
    for (checked, position) in positions.into_iter().enumerate() {
        if checked % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(FilterError::Cancelled);
        }
        let feature = &input.features()[position];
        if keeps(feature, spatial.as_ref(), step) {
            kept.push(Arc::clone(feature));
        }
    }
    Ok(FeatureSet::new(kept))
}

fn keeps(
    feature: &Feature,
    spatial: Option<&(SpatialRelation, Vec<PreparedReference>)>,
    step: &PlannedStep,
) -> bool {
    if let Some((predicate, references)) = spatial {
        let matched = references
            .iter()
            .any(|reference| reference.evaluate(*predicate, &feature.geometry));
        if !matched {
            return false;
        }
    }
    step.attribute
        .as_ref()
        .is_none_or(|expr| expr.matches(feature))
}

/// Positions worth testing: all of them, or the R-tree hits when the
/// predicate needs envelope overlap and the input is large.
fn candidate_positions(
    input: &FeatureSet,
    spatial: Option<&(SpatialRelation, Vec<PreparedReference>)>,
    index_threshold: usize,
) -> Vec<usize> {
    let all = || (0..input.len()).collect();
    let Some((predicate, references)) = spatial else {
        return all();
    };
    if !predicate.uses_envelope_prefilter() || input.len() <= index_threshold {
        return all();
    }
    let index = input.index();
    let mut positions = Vec::new();
    for reference in references {
        if let Some(window) = reference.envelope() {
            positions.extend(index.candidates(&window));
        }
    }
    positions.sort_unstable();
    positions.dedup();
    positions
}
