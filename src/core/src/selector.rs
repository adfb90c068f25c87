//! Backend selection and the per-layer binding registry.

use std::collections::HashMap;
use std::sync::Arc;

use common_exception::{FilterError, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::backend::{
    Backend, BackendKind, BackendPort, EmbeddedAdapter, EmbeddedLocks, GenericAdapter,
    ServerAdapter, ServerClient, ViewNamer,
};
use crate::config::EngineConfig;
use crate::host::HostLayers;
use crate::layer::{LayerId, LayerRef};
use crate::probe::RankedBackends;

/// Outcome of [`BackendSelector::choose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub kind: BackendKind,
    /// Probe advisory for the chosen backend.
    pub warning: Option<String>,
    /// Why a requested override was not honoured.
    pub override_rejected: Option<String>,
}

/// Constructs adapters. Adapters open their connections lazily.
///
/// Each factory is one engine session: server views it creates are named
/// after its own session token.
pub struct BackendFactory {
    server: Option<Arc<dyn ServerClient>>,
    host: Arc<dyn HostLayers>,
    locks: EmbeddedLocks,
    views: Arc<ViewNamer>,
    config: EngineConfig,
}

impl BackendFactory {
    pub fn new(
        server: Option<Arc<dyn ServerClient>>,
        host: Arc<dyn HostLayers>,
        config: EngineConfig,
    ) -> Self {
        Self {
            server,
            host,
            locks: EmbeddedLocks::default(),
            views: Arc::new(ViewNamer::new()),
            config,
        }
    }

    pub fn session(&self) -> &str {
        self.views.session()
    }

    pub fn server_client(&self) -> Option<&Arc<dyn ServerClient>> {
        self.server.as_ref()
    }

    pub fn build(&self, kind: BackendKind, layer: &LayerRef) -> Result<Backend> {
        Ok(match kind {
            BackendKind::Server => {
                let client = self.server.clone().ok_or_else(|| FilterError::BackendUnavailable {
                    layer: layer.id.to_string(),
                    reason: "no server connection configured".to_owned(),
                })?;
                Backend::Server(ServerAdapter::new(
                    layer.clone(),
                    client,
                    Arc::clone(&self.views),
                ))
            }
            BackendKind::Embedded => Backend::Embedded(EmbeddedAdapter::new(
                layer.clone(),
                Arc::clone(&self.host),
                self.locks.clone(),
                self.config.lock_retry,
            )),
            BackendKind::Generic => Backend::Generic(GenericAdapter::new(
                layer.clone(),
                Arc::clone(&self.host),
                self.config.generic_index_threshold,
            )),
        })
    }
}

pub struct BackendSelector {
    factory: BackendFactory,
    bindings: Mutex<HashMap<LayerId, Arc<Backend>>>,
}

impl BackendSelector {
    pub fn new(factory: BackendFactory) -> Self {
        Self {
            factory,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &BackendFactory {
        &self.factory
    }

    /// Picks a backend kind without side effects beyond logging.
    ///
    /// A usable override always wins. An unusable one is rejected and the
    /// first usable entry of the ranking is taken instead.
    pub fn choose(
        &self,
        layer: &LayerRef,
        ranked: &RankedBackends,
        forced: Option<BackendKind>,
    ) -> Result<Selection> {
        let mut override_rejected = None;
        if let Some(kind) = forced {
            if let Some(candidate) = ranked.get(kind) {
                return Ok(Selection {
                    kind,
                    warning: candidate.warning.clone(),
                    override_rejected: None,
                });
            }
            let reason = ranked.rejection(kind).unwrap_or("not usable for this layer");
            warn!(layer = %layer.id, backend = %kind, reason, "rejecting forced backend");
            override_rejected = Some(format!("forced backend '{kind}' rejected: {reason}"));
        }
        let candidate = ranked.first().ok_or_else(|| FilterError::BackendUnavailable {
            layer: layer.id.to_string(),
            reason: ranked
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.kind, r.diagnostic))
                .collect::<Vec<_>>()
                .join("; "),
        })?;
        Ok(Selection {
            kind: candidate.kind,
            warning: candidate.warning.clone(),
            override_rejected,
        })
    }

    /// Chooses and binds a backend. A layer holds at most one live backend.
    pub fn select(
        &self,
        layer: &LayerRef,
        ranked: &RankedBackends,
        forced: Option<BackendKind>,
    ) -> Result<(Arc<Backend>, Selection)> {
        let mut bindings = self.bindings.lock();
        if let Some(bound) = bindings.get(&layer.id) {
            return Err(FilterError::BackendAlreadyBound {
                layer: layer.id.to_string(),
                backend: bound.name().to_owned(),
            });
        }
        let selection = self.choose(layer, ranked, forced)?;
        let backend = Arc::new(self.factory.build(selection.kind, layer)?);
        bindings.insert(layer.id.clone(), Arc::clone(&backend));
        info!(layer = %layer.id, backend = %selection.kind, "bound backend");
        Ok((backend, selection))
    }

    pub fn bound(&self, layer: &LayerId) -> Option<Arc<Backend>> {
        self.bindings.lock().get(layer).cloned()
    }

    pub fn bound_kind(&self, layer: &LayerId) -> Option<BackendKind> {
        self.bindings.lock().get(layer).map(|backend| backend.kind())
    }

    /// Forgets the binding; the caller releases the backend.
    pub fn unbind(&self, layer: &LayerId) -> Option<Arc<Backend>> {
        self.bindings.lock().remove(layer)
    }

    pub fn unbind_all(&self) -> Vec<(LayerId, Arc<Backend>)> {
        self.bindings.lock().drain().collect()
    }
}
