use std::fmt;

use common_exception::{FilterError, Result};
use geo::{Area, BoundingRect, Buffer, ConvexHull, Validation};
use tracing::debug;

use crate::geometry::{Geometry, is_empty};
use crate::simplify::simplify_areal;

/// Relative tolerance for the simplification step, as a fraction of the
/// envelope diagonal.
const SIMPLIFY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    /// The geometry was already valid.
    Unchanged,
    BufferZero,
    SimplifyThenRetry,
    ConvexHull,
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairStrategy::Unchanged => "unchanged",
            RepairStrategy::BufferZero => "buffer(0)",
            RepairStrategy::SimplifyThenRetry => "simplify+buffer(0)",
            RepairStrategy::ConvexHull => "convex hull",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct Repaired {
    pub geometry: Geometry,
    pub strategy: RepairStrategy,
}

/// Returns the geometry itself when valid, otherwise the result of the first
/// strategy that produces a valid, non-empty geometry. Areal geometries also
/// need a positive area, so a polygon collapsed onto a line is repaired or
/// rejected rather than passed through. Strategies run in a
/// fixed order: buffer by zero, simplify then buffer by zero, convex hull.
pub fn repair_geometry(geometry: &Geometry) -> Result<Repaired> {
    if is_empty(geometry) {
        return Err(FilterError::InvalidGeometry(
            "reference geometry is empty".to_owned(),
        ));
    }
    if acceptable(geometry) {
        return Ok(Repaired {
            geometry: geometry.clone(),
            strategy: RepairStrategy::Unchanged,
        });
    }

    let strategies: [(RepairStrategy, fn(&Geometry) -> Option<Geometry>); 3] = [
        (RepairStrategy::BufferZero, buffer_zero),
        (RepairStrategy::SimplifyThenRetry, simplify_then_retry),
        (RepairStrategy::ConvexHull, convex_hull),
    ];
    for (strategy, repair) in strategies {
        match repair(geometry) {
            Some(repaired) if acceptable(&repaired) => {
                debug!(%strategy, "repaired invalid reference geometry");
                return Ok(Repaired {
                    geometry: repaired,
                    strategy,
                });
            }
            _ => debug!(%strategy, "repair strategy did not produce a valid geometry"),
        }
    }

    Err(FilterError::InvalidGeometry(
        "reference geometry is invalid and could not be repaired".to_owned(),
    ))
}

fn acceptable(geometry: &Geometry) -> bool {
    !is_empty(geometry)
        && geometry.is_valid()
        && (!is_areal(geometry) || geometry.unsigned_area() > 0.0)
}

fn is_areal(geometry: &Geometry) -> bool {
    matches!(
        geometry,
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) | Geometry::Rect(_) | Geometry::Triangle(_)
    )
}

fn buffer_zero(geometry: &Geometry) -> Option<Geometry> {
    // buffer_geometry short-circuits zero distances, so call the boolean-ops
    // buffer directly.
    Some(Geometry::MultiPolygon(geometry.buffer(0.0)))
}

fn simplify_then_retry(geometry: &Geometry) -> Option<Geometry> {
    let rect = geometry.bounding_rect()?;
    let epsilon = rect.width().hypot(rect.height()) * SIMPLIFY_TOLERANCE;
    let simplified = simplify_areal(geometry, epsilon)?;
    if simplified.is_valid() {
        return Some(simplified);
    }
    buffer_zero(&simplified)
}

fn convex_hull(geometry: &Geometry) -> Option<Geometry> {
    Some(Geometry::Polygon(geometry.convex_hull()))
}
