#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use common_utils::RetryPolicy;
use geo::{Buffer, Relate};
use layerfilter::attribute::{AttributeExpr, CompareOp, Literal};
use layerfilter::backend::sql::SelectSpec;
use layerfilter::backend::{PlannedStep, ResolvedSpatial, ServerClient, ViewName};
use layerfilter::{
    AttrValue, EngineConfig, EnvironmentCapabilities, Feature, FilterService, InMemoryHost,
    LayerRef, LayerSource, StorageKind,
};
use layerfilter_spatial::{Geometry, SpatialRelation, geometry_from_wkt};
use parking_lot::Mutex;

/// A server engine evaluated in process.
///
/// Tables are keyed by their unquoted `schema.table` name and views are
/// stored as the keys they select. Statements are evaluated row by row with
/// geo's DE-9IM relations and SQL three-valued logic, independently of the
/// in-process engine. Creating a view that already exists is an error, as
/// it is on a real server.
#[derive(Default)]
pub struct SimulatedServer {
    tables: Mutex<HashMap<String, Arc<Vec<Feature>>>>,
    views: Mutex<HashMap<String, Vec<i64>>>,
    unreachable: AtomicBool,
    fail_creates: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    creates: AtomicUsize,
    drops: AtomicUsize,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, features: Vec<Feature>) {
        self.tables.lock().insert(name.to_owned(), Arc::new(features));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn view_count(&self) -> usize {
        self.views.lock().len()
    }

    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_view(&self, qualified: &str) -> bool {
        self.views.lock().contains_key(qualified)
    }

    /// Rows of the first view a subset selects from, if that view exists.
    pub fn selected_rows(&self, subset: &str) -> Option<u64> {
        let at = subset.find("lf_mv_")?;
        let name = subset[at..].split('"').next()?;
        self.views
            .lock()
            .iter()
            .find(|(view, _)| view.ends_with(&format!("\"{name}\"")))
            .map(|(_, ids)| ids.len() as u64)
    }

    /// Whether every view a subset selects from still exists.
    pub fn subset_is_live(&self, subset: &str) -> bool {
        let views = self.views.lock();
        subset.match_indices("lf_mv_").all(|(at, _)| {
            let name = subset[at..].split('"').next().unwrap_or_default();
            views.keys().any(|view| view.ends_with(&format!("\"{name}\"")))
        })
    }
}

#[async_trait]
impl ServerClient for SimulatedServer {
    async fn ping(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FilterError::storage("server", "connection refused"));
        }
        Ok(())
    }

    async fn create_materialized_view(&self, view: &ViewName, select: &SelectSpec) -> Result<()> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(FilterError::storage("server", "could not extend relation"));
        }
        let table = match &select.source.schema {
            Some(schema) => format!("{schema}.{}", select.source.table),
            None => select.source.table.clone(),
        };
        let source = self.tables.lock().get(&table).cloned().ok_or_else(|| {
            FilterError::storage("server", format!("relation {table} does not exist"))
        })?;
        let base_ids = match &select.base {
            Some(base) => Some(self.views.lock().get(&base.qualified()).cloned().ok_or_else(
                || FilterError::storage("server", format!("relation {} does not exist", base.qualified())),
            )?),
            None => None,
        };
        let ids: Vec<i64> = source
            .iter()
            .filter(|feature| base_ids.as_ref().is_none_or(|ids| ids.contains(&feature.id)))
            .filter(|feature| select.steps.iter().all(|step| step_holds(step, feature)))
            .map(|feature| feature.id)
            .collect();

        let mut views = self.views.lock();
        let name = view.qualified();
        if views.contains_key(&name) {
            return Err(FilterError::storage(
                "server",
                format!("relation {name} already exists"),
            ));
        }
        views.insert(name, ids);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn count_rows(&self, view: &ViewName) -> Result<u64> {
        self.views
            .lock()
            .get(&view.qualified())
            .map(|ids| ids.len() as u64)
            .ok_or_else(|| FilterError::storage("server", "view does not exist"))
    }

    async fn drop_materialized_view(&self, view: &ViewName) -> Result<()> {
        if self.views.lock().remove(&view.qualified()).is_some() {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn step_holds(step: &PlannedStep, feature: &Feature) -> bool {
    if let Some(spatial) = &step.spatial {
        if !spatial_holds(spatial, &feature.geometry) {
            return false;
        }
    }
    step.attribute
        .as_ref()
        .is_none_or(|expr| truth(expr, feature) == Some(true))
}

fn spatial_holds(spatial: &ResolvedSpatial, candidate: &Geometry) -> bool {
    spatial.references.iter().any(|reference| {
        let reference = match spatial.buffer {
            Some(distance) if distance != 0.0 => Geometry::MultiPolygon(reference.buffer(distance)),
            _ => reference.clone(),
        };
        let matrix = candidate.relate(&reference);
        match spatial.predicate {
            SpatialRelation::Intersects => matrix.is_intersects(),
            SpatialRelation::Contains => matrix.is_contains(),
            SpatialRelation::Within => matrix.is_within(),
            SpatialRelation::Touches => matrix.is_touches(),
            SpatialRelation::Crosses => matrix.is_crosses(),
            SpatialRelation::Overlaps => matrix.is_overlaps(),
            SpatialRelation::Disjoint => matrix.is_disjoint(),
        }
    })
}

/// SQL truth value of `expr` for one row; `None` is unknown.
fn truth(expr: &AttributeExpr, feature: &Feature) -> Option<bool> {
    match expr {
        AttributeExpr::Compare { field, op, value } => {
            let ordering = sql_compare(feature.attribute(field), value)?;
            Some(match op {
                CompareOp::Eq => ordering.is_eq(),
                CompareOp::NotEq => ordering.is_ne(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::LtEq => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::GtEq => ordering.is_ge(),
            })
        }
        AttributeExpr::InList {
            field,
            values,
            negated,
        } => {
            let value = feature.attribute(field);
            if matches!(value, AttrValue::Null) {
                return None;
            }
            let outcomes: Vec<Option<bool>> = values
                .iter()
                .map(|candidate| sql_compare(value, candidate).map(|o| o.is_eq()))
                .collect();
            let found = if outcomes.contains(&Some(true)) {
                Some(true)
            } else if outcomes.contains(&None) {
                None
            } else {
                Some(false)
            };
            found.map(|found| found != *negated)
        }
        AttributeExpr::IsNull { field, negated } => {
            Some(matches!(feature.attribute(field), AttrValue::Null) != *negated)
        }
        AttributeExpr::Like {
            field,
            pattern,
            negated,
        } => {
            let text = match feature.attribute(field) {
                AttrValue::Null => return None,
                AttrValue::Text(text) => text.to_ascii_lowercase(),
                AttrValue::Int(value) => value.to_string(),
                AttrValue::Float(value) => format!("{value:?}"),
                AttrValue::Bool(value) => i64::from(*value).to_string(),
            };
            Some(wildcard_match(&pattern.to_ascii_lowercase(), &text) != *negated)
        }
        AttributeExpr::And(left, right) => match (truth(left, feature), truth(right, feature)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        AttributeExpr::Or(left, right) => match (truth(left, feature), truth(right, feature)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        AttributeExpr::Not(inner) => truth(inner, feature).map(|value| !value),
    }
}

fn sql_compare(value: &AttrValue, literal: &Literal) -> Option<std::cmp::Ordering> {
    let as_number = |value: &AttrValue| match value {
        AttrValue::Int(v) => Some(*v as f64),
        AttrValue::Float(v) => Some(*v),
        AttrValue::Bool(v) => Some(f64::from(u8::from(*v))),
        _ => None,
    };
    match (value, literal) {
        (AttrValue::Null, _) | (_, Literal::Null) => None,
        (AttrValue::Text(text), Literal::Text(other)) => Some(text.as_str().cmp(other.as_str())),
        (_, Literal::Int(other)) => as_number(value)?.partial_cmp(&(*other as f64)),
        (_, Literal::Float(other)) => as_number(value)?.partial_cmp(other),
        (_, Literal::Bool(other)) => as_number(value)?.partial_cmp(&f64::from(u8::from(*other))),
        _ => None,
    }
}

/// `%` matches any run, `_` one character.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn go(pattern: &[char], text: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => (0..=text.len()).any(|skip| go(rest, &text[skip..])),
            Some(('_', rest)) => !text.is_empty() && go(rest, &text[1..]),
            Some((c, rest)) => text.first() == Some(c) && go(rest, &text[1..]),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    go(&pattern, &text)
}

/// `side * side` points spaced `spacing` apart, ids starting at 1.
///
/// Every third feature is a `rail`, the rest `road`; `speed` cycles through
/// 10..=100 and every seventh `name` is NULL.
pub fn grid(side: i64, spacing: f64) -> Vec<Feature> {
    let mut features = Vec::new();
    for x in 0..side {
        for y in 0..side {
            let id = x * side + y + 1;
            let geometry = geometry_from_wkt(&format!(
                "POINT({} {})",
                x as f64 * spacing,
                y as f64 * spacing
            ))
            .expect("valid point");
            let name = if id % 7 == 0 {
                AttrValue::Null
            } else {
                AttrValue::Text(format!("Feature {id}"))
            };
            features.push(
                Feature::new(id, geometry)
                    .with_attribute("kind", if id % 3 == 0 { "rail" } else { "road" })
                    .with_attribute("speed", (id % 10 + 1) * 10)
                    .with_attribute("name", name),
            );
        }
    }
    features
}

/// Writes features into a new SQLite table with WKT geometries.
pub fn write_sqlite(path: &Path, table: &str, features: &[Feature]) -> anyhow::Result<()> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(&format!(
        "CREATE TABLE \"{table}\" (fid INTEGER PRIMARY KEY, geom TEXT, kind TEXT, speed INTEGER, name TEXT);"
    ))?;
    let tx = conn.unchecked_transaction()?;
    {
        let mut insert = tx.prepare(&format!("INSERT INTO \"{table}\" VALUES (?1, ?2, ?3, ?4, ?5)"))?;
        for feature in features {
            let text = |name: &str| match feature.attribute(name) {
                AttrValue::Text(value) => Some(value.clone()),
                _ => None,
            };
            let speed = match feature.attribute("speed") {
                AttrValue::Int(value) => Some(*value),
                _ => None,
            };
            insert.execute(rusqlite::params![
                feature.id,
                layerfilter_spatial::geometry_to_wkt(&feature.geometry),
                text("kind"),
                speed,
                text("name"),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn server_layer(name: &str) -> LayerRef {
    LayerRef::new(
        name,
        StorageKind::Server,
        LayerSource::new("host=simulated dbname=gis", format!("public.{name}")),
    )
}

pub fn embedded_layer(name: &str, path: &Path) -> LayerRef {
    LayerRef::new(
        name,
        StorageKind::Embedded,
        LayerSource::new(path.to_string_lossy(), name),
    )
}

pub fn generic_layer(name: &str) -> LayerRef {
    LayerRef::new(
        name,
        StorageKind::Generic,
        LayerSource::new(format!("/data/{name}.geojson"), name),
    )
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(40),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_lock_retry(fast_retry(3))
        .with_backend_timeout(Duration::from_secs(10))
}

/// One layer per engine holding the same features.
pub struct Fixture {
    pub host: Arc<InMemoryHost>,
    pub server: Arc<SimulatedServer>,
    pub service: FilterService,
    pub server_layer: LayerRef,
    pub embedded_layer: LayerRef,
    pub generic_layer: LayerRef,
    _dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new(features: Vec<Feature>, config: EngineConfig) -> anyhow::Result<Self> {
        Self::with_environment(features, config, EnvironmentCapabilities::all_available())
    }

    pub fn with_environment(
        features: Vec<Feature>,
        config: EngineConfig,
        env: EnvironmentCapabilities,
    ) -> anyhow::Result<Self> {
        let server = Arc::new(SimulatedServer::new());
        server.add_table("public.parcels_server", features.clone());
        Self::build(features, config, env, server)
    }

    /// A second engine session against the same server and table.
    pub fn sharing_server(&self, features: Vec<Feature>, config: EngineConfig) -> anyhow::Result<Self> {
        Self::build(
            features,
            config,
            EnvironmentCapabilities::all_available(),
            Arc::clone(&self.server),
        )
    }

    fn build(
        features: Vec<Feature>,
        config: EngineConfig,
        env: EnvironmentCapabilities,
        server: Arc<SimulatedServer>,
    ) -> anyhow::Result<Self> {
        common_telemetry::init_test_logging();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("layers.sqlite");
        write_sqlite(&path, "parcels_embedded", &features)?;

        let host = Arc::new(InMemoryHost::new());
        let server_layer = server_layer("parcels_server");
        let embedded_layer = embedded_layer("parcels_embedded", &path);
        let generic_layer = generic_layer("parcels_generic");
        host.add_layer(&server_layer, features.clone());
        host.add_layer(&embedded_layer, features.clone());
        host.add_layer(&generic_layer, features);

        let client: Arc<dyn ServerClient> = server.clone();
        let service = FilterService::with_environment(host.clone(), Some(client), config, env);
        Ok(Self {
            host,
            server,
            service,
            server_layer,
            embedded_layer,
            generic_layer,
            _dir: dir,
        })
    }

    pub fn layers(&self) -> [&LayerRef; 3] {
        [&self.server_layer, &self.embedded_layer, &self.generic_layer]
    }

    /// Adds a layer that only exists in the host, for use as a reference.
    pub fn add_reference_layer(&self, name: &str, wkts: &[&str]) -> anyhow::Result<LayerRef> {
        let layer = generic_layer(name);
        let features = wkts
            .iter()
            .enumerate()
            .map(|(i, wkt)| Ok(Feature::new(i as i64 + 1, geometry_from_wkt(wkt)?)))
            .collect::<Result<Vec<_>>>()?;
        self.host.add_layer(&layer, features);
        Ok(layer)
    }
}
