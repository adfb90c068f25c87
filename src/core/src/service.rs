//! The call surface offered to the UI collaborator.

use std::sync::Arc;

use common_exception::Result;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::backend::ServerClient;
use crate::config::EngineConfig;
use crate::engine::FilterEngine;
use crate::environment::EnvironmentCapabilities;
use crate::events::{EngineEvent, EventBus};
use crate::host::HostLayers;
use crate::layer::{LayerId, LayerRef};
use crate::probe::CapabilityProbe;
use crate::request::FilterRequest;
use crate::selector::{BackendFactory, BackendSelector};
use crate::task::{CleanupCallback, TaskHandle, TaskOrchestrator};

pub struct FilterService {
    engine: Arc<FilterEngine>,
    orchestrator: TaskOrchestrator,
    events: EventBus,
    handles: Mutex<Vec<TaskHandle>>,
}

impl FilterService {
    /// Detects the environment, then builds the service.
    pub async fn new(
        host: Arc<dyn HostLayers>,
        server: Option<Arc<dyn ServerClient>>,
        config: EngineConfig,
    ) -> Self {
        let env = EnvironmentCapabilities::detect(server.as_deref(), config.backend_timeout).await;
        Self::with_environment(host, server, config, env)
    }

    pub fn with_environment(
        host: Arc<dyn HostLayers>,
        server: Option<Arc<dyn ServerClient>>,
        config: EngineConfig,
        env: EnvironmentCapabilities,
    ) -> Self {
        info!(
            server = ?env.server_driver,
            embedded = ?env.embedded_engine,
            forced = ?config.forced_backend,
            "starting filter service"
        );
        let events = EventBus::default();
        let probe = CapabilityProbe::new(env, config.performance_warning_threshold);
        let selector = BackendSelector::new(BackendFactory::new(
            server,
            Arc::clone(&host),
            config.clone(),
        ));
        let engine = FilterEngine::new(host, config, probe, selector, events.clone());
        Self {
            engine: Arc::new(engine),
            orchestrator: TaskOrchestrator::new(events.clone()),
            events,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn submit_filter(&self, layer: LayerRef, request: FilterRequest) -> TaskHandle {
        self.submit_filter_with_cleanup(layer, request, Vec::new())
    }

    /// Like [`FilterService::submit_filter`]; the callbacks run exactly once
    /// when the task ends, however it ends.
    pub fn submit_filter_with_cleanup(
        &self,
        layer: LayerRef,
        request: FilterRequest,
        cleanups: Vec<CleanupCallback>,
    ) -> TaskHandle {
        let engine = Arc::clone(&self.engine);
        let handle = self
            .orchestrator
            .run(layer.id.clone(), cleanups, move |ctx| async move {
                engine.apply(&layer, request, &ctx).await
            });
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle.clone());
        handle
    }

    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        self.orchestrator.cancel(handle.id())
    }

    /// Must be called by the host after any out-of-band change to a layer's
    /// data. Returns the number of cache entries dropped.
    pub async fn notify_layer_mutated(&self, layer: &LayerId) -> usize {
        self.engine.notify_layer_mutated(layer).await
    }

    pub async fn undo_last_step(&self, layer: &LayerId) -> Result<bool> {
        self.engine.undo_last_step(layer).await
    }

    pub async fn reset(&self, layer: &LayerId) -> Result<()> {
        self.engine.reset(layer).await
    }

    /// Cancels running tasks, waits for them to end, then drops every session
    /// artifact and releases all backends.
    pub async fn shutdown(&self) {
        let cancelled = self.orchestrator.cancel_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.wait().await;
        }
        self.engine.shutdown().await;
        info!(cancelled, "filter service shut down");
    }
}
