use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use common_exception::FilterError;
use layerfilter_spatial::Geometry;

/// Stable identity of a host layer.
///
/// Cache entries and history keep this id instead of a live layer object, so
/// they can be dropped after the host has forgotten the layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(Arc<str>);

impl LayerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LayerId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Storage engine tag reported by the host for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Server,
    Embedded,
    Generic,
}

impl StorageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StorageKind::Server => "server",
            StorageKind::Embedded => "embedded",
            StorageKind::Generic => "generic",
        }
    }
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StorageKind {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" | "postgres" | "postgis" => Ok(StorageKind::Server),
            "embedded" | "sqlite" | "spatialite" => Ok(StorageKind::Embedded),
            "generic" | "ogr" => Ok(StorageKind::Generic),
            other => Err(FilterError::Internal(format!(
                "unknown storage kind '{other}'"
            ))),
        }
    }
}

/// Where the layer's rows physically live.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSource {
    /// Connection string, database file path or dataset URI.
    pub location: String,
    /// Table name, optionally schema-qualified (`schema.table`).
    pub table: String,
    pub geometry_column: String,
    pub primary_key: String,
    pub srid: Option<i32>,
}

impl LayerSource {
    pub fn new(location: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            table: table.into(),
            geometry_column: "geom".to_owned(),
            primary_key: "fid".to_owned(),
            srid: None,
        }
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = column.into();
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    /// Splits `schema.table` into its parts.
    pub fn schema_and_table(&self) -> (Option<&str>, &str) {
        match self.table.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, self.table.as_str()),
        }
    }
}

/// Snapshot of a host layer handed to the engine.
///
/// The host owns the layer; the engine reads this value and requests subset
/// changes through the host port.
#[derive(Debug, Clone)]
pub struct LayerRef {
    pub id: LayerId,
    pub storage: StorageKind,
    pub source: LayerSource,
    /// Best effort, may be stale.
    pub feature_count: Option<u64>,
    pub subset: Option<String>,
}

impl LayerRef {
    pub fn new(id: impl Into<LayerId>, storage: StorageKind, source: LayerSource) -> Self {
        Self {
            id: id.into(),
            storage,
            source,
            feature_count: None,
            subset: None,
        }
    }

    pub fn with_feature_count(mut self, count: u64) -> Self {
        self.feature_count = Some(count);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: i64,
    pub geometry: Geometry,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Feature {
    pub fn new(id: i64, geometry: Geometry) -> Self {
        Self {
            id,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Missing attributes read as NULL.
    pub fn attribute(&self, name: &str) -> &AttrValue {
        static NULL: AttrValue = AttrValue::Null;
        self.attributes.get(name).unwrap_or(&NULL)
    }
}
