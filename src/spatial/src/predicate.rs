use std::fmt;
use std::str::FromStr;

use common_exception::FilterError;

/// Spatial relation between a candidate feature and the reference geometry.
///
/// Relations always read "candidate RELATION reference": `Within` keeps the
/// candidates lying inside the reference, `Contains` keeps the candidates that
/// enclose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialRelation {
    Intersects,
    Contains,
    Within,
    Touches,
    Crosses,
    Overlaps,
    Disjoint,
}

impl SpatialRelation {
    pub const ALL: [SpatialRelation; 7] = [
        SpatialRelation::Intersects,
        SpatialRelation::Contains,
        SpatialRelation::Within,
        SpatialRelation::Touches,
        SpatialRelation::Crosses,
        SpatialRelation::Overlaps,
        SpatialRelation::Disjoint,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        let name = name.strip_prefix("st_").unwrap_or(&name);
        match name {
            "intersects" => Some(SpatialRelation::Intersects),
            "contains" => Some(SpatialRelation::Contains),
            "within" => Some(SpatialRelation::Within),
            "touches" => Some(SpatialRelation::Touches),
            "crosses" => Some(SpatialRelation::Crosses),
            "overlaps" => Some(SpatialRelation::Overlaps),
            "disjoint" => Some(SpatialRelation::Disjoint),
            _ => None,
        }
    }

    /// The relation seen from the reference side.
    pub fn invert(&self) -> Self {
        match self {
            SpatialRelation::Contains => SpatialRelation::Within,
            SpatialRelation::Within => SpatialRelation::Contains,
            other => *other,
        }
    }

    /// Name of the OGC function implementing this relation in SQL engines.
    pub fn sql_function(&self) -> &'static str {
        match self {
            SpatialRelation::Intersects => "ST_Intersects",
            SpatialRelation::Contains => "ST_Contains",
            SpatialRelation::Within => "ST_Within",
            SpatialRelation::Touches => "ST_Touches",
            SpatialRelation::Crosses => "ST_Crosses",
            SpatialRelation::Overlaps => "ST_Overlaps",
            SpatialRelation::Disjoint => "ST_Disjoint",
        }
    }

    /// Whether a bounding-box prefilter can discard candidates. Disjoint is
    /// the only relation satisfied by features outside the reference envelope.
    pub fn uses_envelope_prefilter(&self) -> bool {
        !matches!(self, SpatialRelation::Disjoint)
    }
}

impl fmt::Display for SpatialRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpatialRelation::Intersects => "intersects",
            SpatialRelation::Contains => "contains",
            SpatialRelation::Within => "within",
            SpatialRelation::Touches => "touches",
            SpatialRelation::Crosses => "crosses",
            SpatialRelation::Overlaps => "overlaps",
            SpatialRelation::Disjoint => "disjoint",
        };
        write!(f, "{name}")
    }
}

impl FromStr for SpatialRelation {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .ok_or_else(|| FilterError::Internal(format!("unknown spatial predicate '{s}'")))
    }
}
