use std::fmt;
use std::sync::{Arc, OnceLock};

use common_utils::Fingerprinter;
use layerfilter_spatial::{FeatureIndex, Geometry, SpatialRelation, envelope, geometry_to_wkt};

use crate::attribute::AttributeExpr;
use crate::layer::{Feature, LayerRef};

/// Spatial part of a step with its reference geometries already resolved
/// and repaired. Buffers are applied by each engine, to the reference only.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpatial {
    pub predicate: SpatialRelation,
    pub buffer: Option<f64>,
    /// A candidate matches when the predicate holds against any of these.
    pub references: Vec<Geometry>,
}

impl ResolvedSpatial {
    /// Zero buffers are the identity and are dropped.
    pub fn effective_buffer(&self) -> Option<f64> {
        self.buffer.filter(|distance| *distance != 0.0)
    }
}

/// One resolved filtering step. Steps of a plan are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub spatial: Option<ResolvedSpatial>,
    pub attribute: Option<AttributeExpr>,
}

impl PlannedStep {
    pub fn is_spatial(&self) -> bool {
        self.spatial.is_some()
    }

    fn fingerprint_into(&self, hasher: &mut Fingerprinter) {
        match &self.spatial {
            Some(spatial) => {
                hasher.write_str("spatial");
                hasher.write_str(spatial.predicate.sql_function());
                hasher.write_f64(spatial.effective_buffer().unwrap_or(0.0));
                hasher.write_u64(spatial.references.len() as u64);
                for reference in &spatial.references {
                    hasher.write_str(&geometry_to_wkt(reference));
                }
            }
            None => {
                hasher.write_str("no-spatial");
            }
        }
        match &self.attribute {
            Some(expr) => hasher.write_str(&expr.to_string()),
            None => hasher.write_str("no-attribute"),
        };
    }
}

/// Backend-specific result of executing a plan.
#[derive(Debug, Clone)]
pub enum Artifact {
    /// Server materialized view with a spatial index.
    View { schema: Option<String>, name: String },
    /// Session temporary table plus its R*Tree.
    TempTable { name: String, rtree: String },
    /// In-memory feature collection.
    Features(Arc<FeatureSet>),
}

impl Artifact {
    pub fn name(&self) -> String {
        match self {
            Artifact::View { schema, name } => match schema {
                Some(schema) => format!("{schema}.{name}"),
                None => name.clone(),
            },
            Artifact::TempTable { name, .. } => name.clone(),
            Artifact::Features(set) => format!("features[{}]", set.len()),
        }
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Artifact::View { schema, name },
                Artifact::View {
                    schema: other_schema,
                    name: other_name,
                },
            ) => schema == other_schema && name == other_name,
            (Artifact::TempTable { name, .. }, Artifact::TempTable { name: other, .. }) => {
                name == other
            }
            (Artifact::Features(a), Artifact::Features(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An in-memory feature collection; the generic engine's materialization.
///
/// The R-tree over feature envelopes is built on first use.
#[derive(Default)]
pub struct FeatureSet {
    features: Vec<Arc<Feature>>,
    index: OnceLock<FeatureIndex>,
}

impl FeatureSet {
    pub fn new(features: Vec<Arc<Feature>>) -> Self {
        Self {
            features,
            index: OnceLock::new(),
        }
    }

    pub fn from_features(features: Vec<Feature>) -> Self {
        Self::new(features.into_iter().map(Arc::new).collect())
    }

    pub fn features(&self) -> &[Arc<Feature>] {
        &self.features
    }

    pub fn index(&self) -> &FeatureIndex {
        self.index.get_or_init(|| {
            FeatureIndex::build(self.features.iter().map(|f| envelope(&f.geometry)))
        })
    }

    pub fn has_index(&self) -> bool {
        self.index.get().is_some()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.features.iter().map(|f| f.id).collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("features", &self.features.len())
            .field("indexed", &self.has_index())
            .finish()
    }
}

/// A built artifact together with the subset definition that exposes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialization {
    /// Fingerprint of the plan this was built for.
    pub fingerprint: String,
    pub artifact: Artifact,
    pub subset: String,
    /// Known when the build produced it for free.
    pub feature_count: Option<u64>,
}

/// What an adapter is asked to execute.
///
/// With `base` set the steps filter within that materialization; without it
/// they run against the full source table. A flattened history is a plan with
/// every step and no base.
#[derive(Debug, Clone)]
pub struct FilterPlan {
    pub layer: LayerRef,
    pub steps: Vec<PlannedStep>,
    pub base: Option<Materialization>,
    pub fingerprint: String,
}

impl FilterPlan {
    pub fn new(layer: LayerRef, steps: Vec<PlannedStep>, base: Option<Materialization>) -> Self {
        let fingerprint = fingerprint(&layer, &steps, base.as_ref());
        Self {
            layer,
            steps,
            base,
            fingerprint,
        }
    }

    pub fn last_step(&self) -> Option<&PlannedStep> {
        self.steps.last()
    }
}

/// Stable hash of everything that determines a plan's result.
pub fn fingerprint(
    layer: &LayerRef,
    steps: &[PlannedStep],
    base: Option<&Materialization>,
) -> String {
    let mut hasher = Fingerprinter::new();
    hasher
        .write_str(layer.id.as_str())
        .write_str(&layer.source.table)
        .write_str(&layer.source.geometry_column)
        .write_str(&layer.source.primary_key);
    match base {
        Some(base) => hasher.write_str(&base.fingerprint),
        None => hasher.write_str("full"),
    };
    hasher.write_u64(steps.len() as u64);
    for step in steps {
        step.fingerprint_into(&mut hasher);
    }
    hasher.finish_hex()
}
