use std::time::Duration;

use common_exception::Result;
use layerfilter_spatial::{Geometry, SpatialRelation, geometry_from_wkt};

use crate::backend::{BackendKind, Materialization};
use crate::layer::LayerId;

/// Where the reference geometry of a spatial filter comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceSource {
    Geometry(Geometry),
    /// Features of another layer; all of them, or only the listed ids.
    Layer {
        layer: LayerId,
        feature_ids: Option<Vec<i64>>,
    },
}

impl ReferenceSource {
    pub fn wkt(wkt: &str) -> Result<Self> {
        geometry_from_wkt(wkt).map(ReferenceSource::Geometry)
    }

    pub fn layer(layer: impl Into<LayerId>) -> Self {
        ReferenceSource::Layer {
            layer: layer.into(),
            feature_ids: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    pub predicate: SpatialRelation,
    /// Signed distance in layer units, applied to the reference geometry.
    pub buffer: Option<f64>,
    pub reference: ReferenceSource,
}

/// One filtering step as submitted by the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRequest {
    pub spatial: Option<SpatialFilter>,
    /// Expression in the attribute mini-grammar.
    pub attribute: Option<String>,
    /// 0 starts a new chain; greater values compose with the current subset.
    pub step_index: u32,
}

impl FilterRequest {
    pub fn spatial(predicate: SpatialRelation, reference: ReferenceSource) -> Self {
        Self {
            spatial: Some(SpatialFilter {
                predicate,
                buffer: None,
                reference,
            }),
            attribute: None,
            step_index: 0,
        }
    }

    pub fn attribute(expression: impl Into<String>) -> Self {
        Self {
            spatial: None,
            attribute: Some(expression.into()),
            step_index: 0,
        }
    }

    pub fn with_buffer(mut self, distance: f64) -> Self {
        if let Some(spatial) = self.spatial.as_mut() {
            spatial.buffer = Some(distance);
        }
        self
    }

    pub fn with_attribute(mut self, expression: impl Into<String>) -> Self {
        self.attribute = Some(expression.into());
        self
    }

    pub fn at_step(mut self, step_index: u32) -> Self {
        self.step_index = step_index;
        self
    }

    pub fn is_chained(&self) -> bool {
        self.step_index > 0
    }
}

/// Outcome of one executed request.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub success: bool,
    /// Backend-native subset definition to install on the layer.
    pub subset: String,
    /// `None` when the backend cannot count cheaply.
    pub feature_count: Option<u64>,
    pub elapsed: Duration,
    pub backend: BackendKind,
    pub materialization: Option<Materialization>,
}

impl FilterResult {
    pub fn from_materialization(
        backend: BackendKind,
        materialization: Materialization,
        feature_count: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: true,
            subset: materialization.subset.clone(),
            feature_count: feature_count.or(materialization.feature_count),
            elapsed,
            backend,
            materialization: Some(materialization),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}
