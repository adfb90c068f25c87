use geo::{Coord, LineString, MultiPolygon, Polygon};

use crate::geometry::Geometry;

/// Douglas-Peucker simplification of areal geometries. Rings that collapse
/// below four coordinates are dropped; non-areal geometries are returned
/// unchanged.
pub(crate) fn simplify_areal(geometry: &Geometry, epsilon: f64) -> Option<Geometry> {
    match geometry {
        Geometry::Polygon(polygon) => simplify_polygon(polygon, epsilon).map(Geometry::Polygon),
        Geometry::MultiPolygon(multi) => {
            let polygons: Vec<Polygon<f64>> = multi
                .iter()
                .filter_map(|polygon| simplify_polygon(polygon, epsilon))
                .collect();
            (!polygons.is_empty()).then(|| Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        Geometry::Rect(rect) => Some(Geometry::Polygon(rect.to_polygon())),
        Geometry::Triangle(triangle) => Some(Geometry::Polygon(triangle.to_polygon())),
        other => Some(other.clone()),
    }
}

fn simplify_polygon(polygon: &Polygon<f64>, epsilon: f64) -> Option<Polygon<f64>> {
    let exterior = simplify_ring(polygon.exterior(), epsilon)?;
    let interiors = polygon
        .interiors()
        .iter()
        .filter_map(|ring| simplify_ring(ring, epsilon))
        .collect();
    Some(Polygon::new(exterior, interiors))
}

fn simplify_ring(ring: &LineString<f64>, epsilon: f64) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for coord in &ring.0 {
        if coords.last() != Some(coord) {
            coords.push(*coord);
        }
    }
    if coords.len() < 4 {
        return None;
    }
    let simplified = douglas_peucker(&coords, epsilon);
    (simplified.len() >= 4).then(|| LineString::new(simplified))
}

fn douglas_peucker(coords: &[Coord<f64>], epsilon: f64) -> Vec<Coord<f64>> {
    if coords.len() < 3 {
        return coords.to_vec();
    }
    let first = coords[0];
    let last = coords[coords.len() - 1];
    let (index, distance) = coords[1..coords.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, c)| (i + 1, perpendicular_distance(*c, first, last)))
        .fold((0, 0.0), |best, item| if item.1 > best.1 { item } else { best });

    if distance > epsilon {
        let mut left = douglas_peucker(&coords[..=index], epsilon);
        let right = douglas_peucker(&coords[index..], epsilon);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

fn perpendicular_distance(point: Coord<f64>, start: Coord<f64>, end: Coord<f64>) -> f64 {
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let length = dx.hypot(dy);
    if length == 0.0 {
        return (point.x - start.x).hypot(point.y - start.y);
    }
    ((point.x - start.x) * dy - (point.y - start.y) * dx).abs() / length
}
