//! The per-layer filter execution engine.
//!
//! Each layer runs at most one filter at a time; later requests queue on the
//! layer's gate. A request moves the layer from `Idle` to `Filtering` and back
//! to `Idle` on success. On failure it passes through `Failed`, where the
//! layer's subset is restored to its value before the request, and then
//! returns to `Idle` with history unchanged.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Instant;

use common_exception::{FilterError, Result};
use layerfilter_spatial::{Geometry, RepairStrategy, repair_geometry};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attribute::parse;
use crate::backend::{
    Backend, BackendKind, BackendPort, ExecutionContext, FilterPlan, PlannedStep, ResolvedSpatial,
};
use crate::cache::{CacheKey, MaterializationCache};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus, Phase};
use crate::history::{HistoryEntry, MultiStepHistory};
use crate::host::{FeatureScope, HostLayers};
use crate::layer::{LayerId, LayerRef};
use crate::probe::CapabilityProbe;
use crate::request::{FilterRequest, FilterResult, ReferenceSource};
use crate::selector::BackendSelector;
use crate::task::{TaskContext, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnginePhase {
    Idle,
    Filtering,
    Failed,
}

impl Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnginePhase::Idle => "idle",
            EnginePhase::Filtering => "filtering",
            EnginePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct LayerSlot {
    phase: Mutex<EnginePhase>,
    gate: tokio::sync::Mutex<MultiStepHistory>,
}

impl LayerSlot {
    fn transition(&self, layer: &LayerId, to: EnginePhase) {
        let from = std::mem::replace(&mut *self.phase.lock(), to);
        debug!(layer = %layer, %from, %to, "layer phase");
    }
}

/// Restores a layer's subset unless disarmed. Fires on error returns and
/// when the request future is dropped mid-flight.
struct SubsetRollback {
    host: Arc<dyn HostLayers>,
    layer: LayerId,
    before: Option<String>,
    armed: bool,
}

impl SubsetRollback {
    fn new(host: Arc<dyn HostLayers>, layer: LayerId, before: Option<String>) -> Self {
        Self {
            host,
            layer,
            before,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SubsetRollback {
    fn drop(&mut self) {
        if !self.armed || self.host.get_subset(&self.layer) == self.before {
            return;
        }
        if self.host.set_subset(&self.layer, self.before.as_deref()) {
            warn!(layer = %self.layer, "restored subset after failed filter");
        } else {
            error!(layer = %self.layer, "host refused to restore the previous subset");
        }
    }
}

pub struct FilterEngine {
    host: Arc<dyn HostLayers>,
    config: EngineConfig,
    probe: CapabilityProbe,
    selector: BackendSelector,
    cache: MaterializationCache,
    events: EventBus,
    layers: Mutex<HashMap<LayerId, Arc<LayerSlot>>>,
}

impl FilterEngine {
    pub fn new(
        host: Arc<dyn HostLayers>,
        config: EngineConfig,
        probe: CapabilityProbe,
        selector: BackendSelector,
        events: EventBus,
    ) -> Self {
        Self {
            cache: MaterializationCache::new(config.cache_max_entries),
            host,
            config,
            probe,
            selector,
            events,
            layers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &MaterializationCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn phase(&self, layer: &LayerId) -> EnginePhase {
        self.layers
            .lock()
            .get(layer)
            .map_or(EnginePhase::Idle, |slot| *slot.phase.lock())
    }

    /// Token naming this engine's server-side artifacts.
    pub fn session(&self) -> &str {
        self.selector.factory().session()
    }

    pub fn bound_backend(&self, layer: &LayerId) -> Option<BackendKind> {
        self.selector.bound_kind(layer)
    }

    pub async fn history_len(&self, layer: &LayerId) -> usize {
        self.slot(layer).gate.lock().await.len()
    }

    fn slot(&self, layer: &LayerId) -> Arc<LayerSlot> {
        let mut layers = self.layers.lock();
        let slot = layers.entry(layer.clone()).or_insert_with(|| {
            Arc::new(LayerSlot {
                phase: Mutex::new(EnginePhase::Idle),
                gate: tokio::sync::Mutex::new(MultiStepHistory::new(self.config.history_depth)),
            })
        });
        Arc::clone(slot)
    }

    /// Applies one request to a layer. The subset is either replaced by the
    /// result or left exactly as it was.
    pub async fn apply(
        &self,
        layer: &LayerRef,
        request: FilterRequest,
        task: &TaskContext,
    ) -> Result<FilterResult> {
        let slot = self.slot(&layer.id);
        let mut history = match slot.gate.try_lock() {
            Ok(history) => history,
            Err(_) => {
                debug!(task = %task.id, layer = %layer.id, "queued behind running filter");
                self.events.publish(EngineEvent::TaskQueued {
                    task: task.id,
                    layer: layer.id.clone(),
                });
                tokio::select! {
                    history = slot.gate.lock() => history,
                    _ = task.cancel.cancelled() => return Err(FilterError::Cancelled),
                }
            }
        };
        if task.is_cancelled() {
            return Err(FilterError::Cancelled);
        }

        slot.transition(&layer.id, EnginePhase::Filtering);
        let subset_before = self.host.get_subset(&layer.id);
        let rollback = SubsetRollback::new(
            Arc::clone(&self.host),
            layer.id.clone(),
            subset_before.clone(),
        );
        match self
            .execute(layer, request, task, &mut history, subset_before)
            .await
        {
            Ok(result) => {
                rollback.disarm();
                slot.transition(&layer.id, EnginePhase::Idle);
                Ok(result)
            }
            Err(e) => {
                slot.transition(&layer.id, EnginePhase::Failed);
                drop(rollback);
                if !e.is_cancelled() {
                    warn!(layer = %layer.id, error = %e, "filter failed");
                }
                slot.transition(&layer.id, EnginePhase::Idle);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        layer: &LayerRef,
        request: FilterRequest,
        task: &TaskContext,
        history: &mut MultiStepHistory,
        subset_before: Option<String>,
    ) -> Result<FilterResult> {
        let started = Instant::now();
        let backend = self.bind(layer)?;
        let kind = backend.kind();
        task.set_backend(kind);

        let ctx = ExecutionContext::new(
            task.id,
            layer.id.clone(),
            task.cancel.clone(),
            self.events.clone(),
            self.cache.clone(),
        );
        ctx.checkpoint(Phase::ResolveReference)?;
        let step = self.plan_step(&request).await?;

        let chained = request.is_chained() && !history.is_empty();
        if request.is_chained() && !chained {
            debug!(layer = %layer.id, step = request.step_index, "no chain to extend, starting a new one");
        }
        let (plan, plan_steps) = self.compose(layer, &backend, history, step, chained);
        debug!(
            layer = %layer.id,
            backend = %kind,
            steps = plan.steps.len(),
            incremental = plan.base.is_some(),
            fingerprint = %plan.fingerprint,
            "dispatching plan"
        );

        let generation = self.cache.generation(&layer.id);
        let mut result = self.dispatch(&backend, &plan, &ctx).await?;
        if self.cache.generation(&layer.id) != generation {
            return Err(FilterError::Host(format!(
                "layer '{}' changed while the filter was running",
                layer.id
            )));
        }

        if !self.host.set_subset(&layer.id, Some(&result.subset)) {
            return Err(FilterError::Host(format!(
                "host rejected the subset for layer '{}'",
                layer.id
            )));
        }
        // An invalidation can land while the host installs the subset; the
        // rollback guard then puts the previous subset back.
        if self.cache.generation(&layer.id) != generation {
            return Err(FilterError::Host(format!(
                "layer '{}' changed while its subset was being installed",
                layer.id
            )));
        }
        result.elapsed = started.elapsed();

        let key = CacheKey::new(layer.id.clone(), kind, plan.fingerprint.clone());
        let cache_key = self.cache.acquire(&key).then_some(key);
        let mut dropped = if chained {
            Vec::new()
        } else {
            history.start_chain()
        };
        dropped.extend(history.push(HistoryEntry {
            request,
            result: result.clone(),
            subset_before,
            cache_key,
            plan_steps,
        }));
        for entry in &dropped {
            if let Some(key) = &entry.cache_key {
                self.cache.release(key);
            }
        }
        self.discard_retired().await;

        info!(
            layer = %layer.id,
            backend = %kind,
            features = ?result.feature_count,
            elapsed = ?result.elapsed,
            "filter applied"
        );
        Ok(result)
    }

    /// Returns the layer's backend, binding one on first use.
    fn bind(&self, layer: &LayerRef) -> Result<Arc<Backend>> {
        if let Some(backend) = self.selector.bound(&layer.id) {
            return Ok(backend);
        }
        let ranked = self.probe.probe(layer);
        let (backend, selection) =
            self.selector
                .select(layer, &ranked, self.config.forced_backend)?;
        if let Some(message) = selection.override_rejected {
            self.events.publish(EngineEvent::Advisory {
                layer: layer.id.clone(),
                backend: self.config.forced_backend,
                message,
            });
        }
        if let Some(message) = selection.warning {
            warn!(layer = %layer.id, backend = %selection.kind, "{message}");
            self.events.publish(EngineEvent::Advisory {
                layer: layer.id.clone(),
                backend: Some(selection.kind),
                message,
            });
        }
        Ok(backend)
    }

    async fn plan_step(&self, request: &FilterRequest) -> Result<PlannedStep> {
        let spatial = match &request.spatial {
            Some(filter) => {
                if filter.buffer.is_some_and(|distance| !distance.is_finite()) {
                    return Err(FilterError::InvalidGeometry(
                        "buffer distance must be finite".to_owned(),
                    ));
                }
                let references = self.resolve_references(&filter.reference).await?;
                Some(ResolvedSpatial {
                    predicate: filter.predicate,
                    buffer: filter.buffer,
                    references,
                })
            }
            None => None,
        };
        let attribute = request.attribute.as_deref().map(parse).transpose()?;
        if spatial.is_none() && attribute.is_none() {
            return Err(FilterError::InvalidExpression(
                "request has neither a spatial predicate nor an attribute expression".to_owned(),
            ));
        }
        Ok(PlannedStep { spatial, attribute })
    }

    async fn resolve_references(&self, source: &ReferenceSource) -> Result<Vec<Geometry>> {
        let geometries = match source {
            ReferenceSource::Geometry(geometry) => vec![geometry.clone()],
            ReferenceSource::Layer { layer, feature_ids } => {
                let features = self
                    .host
                    .fetch_features(layer, FeatureScope::Visible)
                    .await?;
                let geometries: Vec<Geometry> = features
                    .into_iter()
                    .filter(|f| feature_ids.as_ref().is_none_or(|ids| ids.contains(&f.id)))
                    .map(|f| f.geometry)
                    .collect();
                if geometries.is_empty() {
                    return Err(FilterError::InvalidGeometry(format!(
                        "reference layer '{layer}' has no features in scope"
                    )));
                }
                geometries
            }
        };
        geometries
            .iter()
            .map(|geometry| {
                let repaired = repair_geometry(geometry)?;
                if repaired.strategy != RepairStrategy::Unchanged {
                    info!(strategy = %repaired.strategy, "repaired reference geometry");
                }
                Ok(repaired.geometry)
            })
            .collect()
    }

    /// Builds the plan for a step: within the previous materialization when it
    /// is still cached, otherwise the whole chain flattened into one plan.
    fn compose(
        &self,
        layer: &LayerRef,
        backend: &Backend,
        history: &MultiStepHistory,
        step: PlannedStep,
        chained: bool,
    ) -> (FilterPlan, Vec<PlannedStep>) {
        let previous = history.last().filter(|_| chained);
        let Some(previous) = previous else {
            let steps = vec![step];
            return (FilterPlan::new(layer.clone(), steps.clone(), None), steps);
        };
        let mut plan_steps = previous.plan_steps.clone();
        plan_steps.push(step.clone());

        let base = previous
            .cache_key
            .as_ref()
            .filter(|key| key.backend == backend.kind())
            .and_then(|key| self.cache.lookup(key))
            .filter(|_| backend.capabilities().supports_incremental_composition);
        let plan = match base {
            Some(base) => FilterPlan::new(layer.clone(), vec![step], Some(base)),
            None => {
                debug!(layer = %layer.id, steps = plan_steps.len(), "flattening history");
                FilterPlan::new(layer.clone(), plan_steps.clone(), None)
            }
        };
        (plan, plan_steps)
    }

    async fn dispatch(
        &self,
        backend: &Backend,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        let kind = backend.kind();
        match kind {
            BackendKind::Server | BackendKind::Embedded => {
                let timeout = self.config.backend_timeout;
                tokio::time::timeout(timeout, backend.execute(plan, ctx))
                    .await
                    .unwrap_or_else(|_| {
                        Err(FilterError::Timeout {
                            backend: kind.name().to_owned(),
                            elapsed: timeout,
                        })
                    })
            }
            BackendKind::Generic => backend.execute(plan, ctx).await,
        }
    }

    /// Drops the artifacts of everything the cache let go of.
    async fn discard_retired(&self) {
        for entry in self.cache.take_retired() {
            let Some(backend) = self.selector.bound(&entry.key.layer) else {
                continue;
            };
            if let Err(e) = backend.discard(&entry.materialization).await {
                warn!(
                    layer = %entry.key.layer,
                    artifact = %entry.materialization.artifact.name(),
                    error = %e,
                    "failed to discard materialization"
                );
            }
        }
    }

    /// Reverts the most recent step. Returns false when there is nothing to
    /// undo.
    pub async fn undo_last_step(&self, layer: &LayerId) -> Result<bool> {
        let slot = self.slot(layer);
        let mut history = slot.gate.lock().await;
        let Some(entry) = history.pop_last() else {
            return Ok(false);
        };
        if !self.host.set_subset(layer, entry.subset_before.as_deref()) {
            history.push(entry);
            return Err(FilterError::Host(format!(
                "host rejected the previous subset for layer '{layer}'"
            )));
        }
        if let Some(key) = &entry.cache_key {
            self.cache.release(key);
        }
        debug!(layer = %layer, remaining = history.len(), "undid last step");
        drop(history);
        self.discard_retired().await;
        Ok(true)
    }

    /// Restores the subset the layer had before its first recorded step and
    /// clears its history.
    pub async fn reset(&self, layer: &LayerId) -> Result<()> {
        let slot = self.slot(layer);
        let mut history = slot.gate.lock().await;
        let Some(origin) = history.origin().map(|subset| subset.map(ToOwned::to_owned)) else {
            return Ok(());
        };
        if !self.host.set_subset(layer, origin.as_deref()) {
            return Err(FilterError::Host(format!(
                "host rejected the original subset for layer '{layer}'"
            )));
        }
        let (_, entries) = history.take_all();
        for key in entries.iter().filter_map(|entry| entry.cache_key.as_ref()) {
            self.cache.release(key);
        }
        debug!(layer = %layer, steps = entries.len(), "reset layer");
        Ok(())
    }

    /// Invalidates everything cached for a layer after an out-of-band change.
    ///
    /// The generation bump is immediate, so a filter still running on stale
    /// data fails instead of installing its result. Once that filter is done
    /// the layer's artifacts are dropped, the backend's loaded data released
    /// and the current chain rebuilt against the new data as one flattened
    /// step. If the rebuild fails the layer goes back to its original subset,
    /// so the subset never names an artifact that no longer exists.
    pub async fn notify_layer_mutated(&self, layer: &LayerId) -> usize {
        let dropped = self.cache.invalidate(layer);
        let slot = self.slot(layer);
        let mut history = slot.gate.lock().await;
        self.discard_retired().await;
        let backend = self.selector.bound(layer);
        if let Some(backend) = &backend {
            if let Err(e) = backend.release().await {
                warn!(layer = %layer, error = %e, "failed to release backend after mutation");
            }
        }
        if !history.is_empty() {
            match backend {
                Some(backend) => self.rebuild_chain(&backend, &mut history).await,
                None => self.restore_origin(layer, &mut history),
            }
        }
        dropped
    }

    /// Re-runs the newest chain from scratch and installs its result.
    async fn rebuild_chain(&self, backend: &Backend, history: &mut MultiStepHistory) {
        let layer = backend.layer();
        let Some(last) = history.last() else {
            return;
        };
        let request = last.request.clone();
        let plan_steps = last.plan_steps.clone();
        let plan = FilterPlan::new(layer.clone(), plan_steps.clone(), None);
        let ctx = ExecutionContext::new(
            TaskId(0),
            layer.id.clone(),
            CancellationToken::new(),
            self.events.clone(),
            self.cache.clone(),
        );
        let result = match self.dispatch(backend, &plan, &ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(layer = %layer.id, error = %e, "could not rebuild filter after mutation");
                self.restore_origin(&layer.id, history);
                return;
            }
        };
        if !self.host.set_subset(&layer.id, Some(&result.subset)) {
            error!(layer = %layer.id, "host rejected the rebuilt subset");
            self.restore_origin(&layer.id, history);
            return;
        }

        let (origin, entries) = history.take_all();
        for key in entries.iter().filter_map(|entry| entry.cache_key.as_ref()) {
            self.cache.release(key);
        }
        let key = CacheKey::new(layer.id.clone(), backend.kind(), plan.fingerprint.clone());
        let cache_key = self.cache.acquire(&key).then_some(key);
        history.push(HistoryEntry {
            request,
            result,
            subset_before: origin.flatten(),
            cache_key,
            plan_steps,
        });
        info!(layer = %layer.id, steps = entries.len(), "rebuilt filter after mutation");
    }

    /// Puts back the subset the layer had before its first step and forgets
    /// the history.
    fn restore_origin(&self, layer: &LayerId, history: &mut MultiStepHistory) {
        let (origin, entries) = history.take_all();
        for key in entries.iter().filter_map(|entry| entry.cache_key.as_ref()) {
            self.cache.release(key);
        }
        let Some(origin) = origin else {
            return;
        };
        if !self.host.set_subset(layer, origin.as_deref()) {
            error!(layer = %layer, "host refused to restore the original subset");
        }
    }

    /// Drops every cache entry and releases every bound backend.
    ///
    /// Layers with recorded steps get their original subset back first, since
    /// their current subsets name artifacts that are about to be dropped.
    pub async fn shutdown(&self) {
        let slots: Vec<(LayerId, Arc<LayerSlot>)> = self
            .layers
            .lock()
            .iter()
            .map(|(layer, slot)| (layer.clone(), Arc::clone(slot)))
            .collect();
        for (layer, slot) in slots {
            let mut history = slot.gate.lock().await;
            if !history.is_empty() {
                self.restore_origin(&layer, &mut history);
            }
        }
        let dropped = self.cache.clear();
        self.discard_retired().await;
        for (layer, backend) in self.selector.unbind_all() {
            if let Err(e) = backend.release().await {
                warn!(layer = %layer, backend = %backend.kind(), error = %e, "failed to release backend");
            }
        }
        self.layers.lock().clear();
        info!(dropped, "filter engine shut down");
    }
}
