//! The host layer-model port.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use parking_lot::RwLock;

use crate::layer::{Feature, LayerId, LayerRef, StorageKind};

/// Which features of a layer to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureScope {
    /// The full dataset, ignoring the current subset.
    All,
    /// Only what the layer's current subset exposes.
    Visible,
}

/// What the engine needs from the host application's layer model.
#[async_trait]
pub trait HostLayers: Send + Sync {
    fn get_subset(&self, layer: &LayerId) -> Option<String>;

    /// Installs a subset definition; `None` clears it. Returns false when the
    /// host rejects the definition.
    fn set_subset(&self, layer: &LayerId, subset: Option<&str>) -> bool;

    fn layer_storage_kind(&self, layer: &LayerId) -> Option<StorageKind>;

    /// Reads features through the host's own data provider.
    async fn fetch_features(&self, layer: &LayerId, scope: FeatureScope) -> Result<Vec<Feature>>;
}

struct HostLayer {
    storage: StorageKind,
    subset: Option<String>,
    features: Arc<Vec<Feature>>,
    visible: Option<Vec<i64>>,
}

/// A host kept entirely in memory, for tests and the command line tool.
#[derive(Default)]
pub struct InMemoryHost {
    layers: RwLock<HashMap<LayerId, HostLayer>>,
    refuse_subsets: AtomicBool,
    subset_writes: AtomicUsize,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&self, layer: &LayerRef, features: Vec<Feature>) {
        self.layers.write().insert(
            layer.id.clone(),
            HostLayer {
                storage: layer.storage,
                subset: layer.subset.clone(),
                features: Arc::new(features),
                visible: None,
            },
        );
    }

    /// Restricts what [`FeatureScope::Visible`] returns for a layer.
    pub fn set_visible(&self, layer: &LayerId, ids: Option<Vec<i64>>) {
        if let Some(entry) = self.layers.write().get_mut(layer) {
            entry.visible = ids;
        }
    }

    pub fn replace_features(&self, layer: &LayerId, features: Vec<Feature>) {
        if let Some(entry) = self.layers.write().get_mut(layer) {
            entry.features = Arc::new(features);
        }
    }

    /// Makes every later `set_subset` call fail.
    pub fn refuse_subset_changes(&self, refuse: bool) {
        self.refuse_subsets.store(refuse, Ordering::SeqCst);
    }

    /// Number of accepted `set_subset` calls.
    pub fn subset_writes(&self) -> usize {
        self.subset_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostLayers for InMemoryHost {
    fn get_subset(&self, layer: &LayerId) -> Option<String> {
        self.layers
            .read()
            .get(layer)
            .and_then(|entry| entry.subset.clone())
    }

    fn set_subset(&self, layer: &LayerId, subset: Option<&str>) -> bool {
        if self.refuse_subsets.load(Ordering::SeqCst) {
            return false;
        }
        match self.layers.write().get_mut(layer) {
            Some(entry) => {
                entry.subset = subset.map(ToOwned::to_owned);
                self.subset_writes.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn layer_storage_kind(&self, layer: &LayerId) -> Option<StorageKind> {
        self.layers.read().get(layer).map(|entry| entry.storage)
    }

    async fn fetch_features(&self, layer: &LayerId, scope: FeatureScope) -> Result<Vec<Feature>> {
        let (features, visible) = {
            let layers = self.layers.read();
            let entry = layers
                .get(layer)
                .ok_or_else(|| FilterError::Host(format!("unknown layer '{layer}'")))?;
            (Arc::clone(&entry.features), entry.visible.clone())
        };
        Ok(match (scope, visible) {
            (FeatureScope::Visible, Some(ids)) => features
                .iter()
                .filter(|feature| ids.contains(&feature.id))
                .cloned()
                .collect(),
            _ => features.as_ref().clone(),
        })
    }
}
