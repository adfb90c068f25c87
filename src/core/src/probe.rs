//! Ranks the backends able to filter a layer.

use tracing::debug;

use crate::backend::{BackendCapabilities, BackendKind, short_count};
use crate::environment::EnvironmentCapabilities;
use crate::layer::{LayerRef, StorageKind};

/// A usable backend, with an advisory when it is a poor fit for the layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedBackend {
    pub kind: BackendKind,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedBackend {
    pub kind: BackendKind,
    pub diagnostic: String,
}

/// Probe outcome. `candidates` keeps the server, embedded, generic order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankedBackends {
    pub candidates: Vec<RankedBackend>,
    pub rejected: Vec<RejectedBackend>,
}

impl RankedBackends {
    pub fn first(&self) -> Option<&RankedBackend> {
        self.candidates.first()
    }

    pub fn get(&self, kind: BackendKind) -> Option<&RankedBackend> {
        self.candidates.iter().find(|c| c.kind == kind)
    }

    pub fn is_usable(&self, kind: BackendKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn rejection(&self, kind: BackendKind) -> Option<&str> {
        self.rejected
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.diagnostic.as_str())
    }
}

pub struct CapabilityProbe {
    env: EnvironmentCapabilities,
    warning_threshold: u64,
}

impl CapabilityProbe {
    pub fn new(env: EnvironmentCapabilities, warning_threshold: u64) -> Self {
        Self {
            env,
            warning_threshold,
        }
    }

    pub fn environment(&self) -> &EnvironmentCapabilities {
        &self.env
    }

    /// Never fails: a backend that cannot serve the layer is listed in
    /// `rejected` with the reason.
    pub fn probe(&self, layer: &LayerRef) -> RankedBackends {
        let mut ranked = RankedBackends::default();
        for kind in BackendKind::RANKING {
            match self.unusable_reason(kind, layer.storage) {
                Some(diagnostic) => ranked.rejected.push(RejectedBackend { kind, diagnostic }),
                None => ranked.candidates.push(RankedBackend {
                    kind,
                    warning: self.warning(kind, layer),
                }),
            }
        }
        debug!(
            layer = %layer.id,
            candidates = ?ranked.candidates.iter().map(|c| c.kind).collect::<Vec<_>>(),
            rejected = ranked.rejected.len(),
            "probed backends"
        );
        ranked
    }

    fn unusable_reason(&self, kind: BackendKind, storage: StorageKind) -> Option<String> {
        match kind {
            BackendKind::Server => {
                if storage != StorageKind::Server {
                    return Some(format!("layer is stored in the {storage} engine"));
                }
                self.env
                    .server_driver
                    .reason()
                    .map(|reason| format!("server driver unavailable: {reason}"))
            }
            BackendKind::Embedded => {
                if storage == StorageKind::Generic {
                    return Some("layer is not stored in a database".to_owned());
                }
                self.env
                    .embedded_engine
                    .reason()
                    .map(|reason| format!("embedded engine unavailable: {reason}"))
            }
            BackendKind::Generic => None,
        }
    }

    fn warning(&self, kind: BackendKind, layer: &LayerRef) -> Option<String> {
        let count = layer.feature_count?;
        let capabilities = BackendCapabilities::for_kind(kind);
        if capabilities.exceeds_recommended(count) {
            return Some(format!(
                "{kind} engine on {} features: expect >{}s",
                short_count(count),
                capabilities.estimated_seconds(count)
            ));
        }
        if native_backend(layer.storage) != kind && count > self.warning_threshold {
            return Some(format!(
                "{kind} engine filtering a {} layer of {} features: native engine would be faster",
                layer.storage,
                short_count(count)
            ));
        }
        None
    }
}

fn native_backend(storage: StorageKind) -> BackendKind {
    match storage {
        StorageKind::Server => BackendKind::Server,
        StorageKind::Embedded => BackendKind::Embedded,
        StorageKind::Generic => BackendKind::Generic,
    }
}
