use geo::Buffer;

use crate::geometry::{Geometry, is_empty};

/// Buffers the reference geometry by `distance` layer units.
///
/// Positive distances grow the geometry, negative ones erode areal
/// geometries (and collapse points and lines to an empty result). A zero
/// distance returns the geometry unchanged.
pub fn buffer_geometry(geometry: &Geometry, distance: f64) -> Geometry {
    if distance == 0.0 || is_empty(geometry) {
        return geometry.clone();
    }
    Geometry::MultiPolygon(geometry.buffer(distance))
}

#[cfg(test)]
mod tests {
    use geo::{Area, Contains};

    use super::*;
    use crate::geometry::geometry_from_wkt;

    #[test]
    fn point_buffer_is_disc() {
        let point = geometry_from_wkt("POINT(0 0)").unwrap();
        let disc = buffer_geometry(&point, 10.0);
        let area = disc.unsigned_area();
        let expected = std::f64::consts::PI * 100.0;
        assert!((area - expected).abs() / expected < 0.02, "area {area}");
        assert!(disc.contains(&geo::Point::new(9.0, 0.0)));
        assert!(!disc.contains(&geo::Point::new(11.0, 0.0)));
    }

    #[test]
    fn negative_buffer_shrinks_square() {
        let square = geometry_from_wkt("POLYGON((0 0,10 0,10 10,0 10,0 0))").unwrap();
        let shrunk = buffer_geometry(&square, -2.0);
        assert!((shrunk.unsigned_area() - 36.0).abs() < 1e-6);
    }

    #[test]
    fn zero_distance_is_identity() {
        let line = geometry_from_wkt("LINESTRING(0 0,5 5)").unwrap();
        assert_eq!(buffer_geometry(&line, 0.0), line);
    }
}
